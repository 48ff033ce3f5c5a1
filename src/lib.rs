//! OIDC Gateway Library
//!
//! An OIDC-aware reverse proxy acting as a policy enforcement point in
//! front of plain HTTP services.
//!
//! # Features
//!
//! - **Dynamic client registration**: providers are bootstrapped in the
//!   background with bounded retries; one slow IdP never blocks the rest
//! - **Credential persistence**: registrations survive restarts via an
//!   atomically-written, owner-only credential store
//! - **Policy enforcement**: JSON policy trees with longest-prefix match,
//!   fail-closed, atomically reloadable at runtime
//! - **Identity forwarding**: validated claims injected as headers for
//!   backends that opt in
//! - **Production ready**: TLS termination, plain-HTTP redirect listener,
//!   graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ac;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod scheduler;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
