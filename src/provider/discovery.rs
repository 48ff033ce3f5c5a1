//! OpenID Connect provider discovery
//!
//! Fetches the provider configuration document from
//! `<issuer>/.well-known/openid-configuration`. Network failures are
//! transient (the bootstrap scheduler retries them); a reachable provider
//! that serves a malformed or mismatching document is a configuration error
//! and is not retried.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// OpenID Provider Metadata, the subset the gateway consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer URL; must match the URL the document was discovered from
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS URI for ID-token signature keys
    pub jwks_uri: String,

    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Dynamic client registration endpoint (optional)
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default)]
    pub scopes_supported: Vec<String>,

    /// Supported response types
    #[serde(default)]
    pub response_types_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Discover provider metadata from an issuer URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransientProvider`] when the provider is unreachable
    /// or answers with a server error, and [`Error::Config`] when the
    /// document is malformed or its `issuer` does not match.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering provider metadata");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::from_provider_request("Discovery request failed", &e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::TransientProvider(format!(
                "Discovery at {url} failed: HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::Config(format!(
                "Discovery at {url} failed: HTTP {status}"
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Config(format!("Malformed discovery document at {url}: {e}")))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(Error::Config(format!(
                "Issuer mismatch: requested {issuer}, document says {}",
                metadata.issuer
            )));
        }

        debug!(issuer = %metadata.issuer, "Discovered provider");
        Ok(metadata)
    }

    /// Whether the provider advertises dynamic client registration.
    #[must_use]
    pub fn supports_registration(&self) -> bool {
        self.registration_endpoint.is_some()
    }
}
