//! Error types for the OIDC gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the OIDC gateway
pub type Result<T> = std::result::Result<T, Error>;

/// OIDC gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (malformed provider metadata, policy document,
    /// or credential file). Fatal to the unit of work, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient failure talking to an identity provider. Retryable.
    #[error("Provider communication error: {0}")]
    TransientProvider(String),

    /// Unknown provider name
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Backend origin unreachable (surfaced as 502, never retried)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a scheduled task failing with this error should be retried.
    ///
    /// Only provider communication failures are transient; configuration
    /// errors and everything else fail the task permanently.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientProvider(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// HTTP status this error maps to at the proxy boundary.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a reqwest error from an identity-provider round trip.
    ///
    /// Connection-level failures become [`Error::TransientProvider`] so the
    /// scheduler retries them; anything else (e.g. a decode error on the
    /// response body) is a permanent [`Error::Config`].
    #[must_use]
    pub fn from_provider_request(context: &str, e: &reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Self::TransientProvider(format!("{context}: {e}"))
        } else {
            Self::Config(format!("{context}: {e}"))
        }
    }
}
