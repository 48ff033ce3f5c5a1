//! OIDC provider integration: discovery, registration, verification, and
//! client lifecycle.

pub mod discovery;
pub mod manager;
pub mod registration;
pub mod verify;

pub use discovery::ProviderMetadata;
pub use manager::{OidcClient, ProviderManager, TokenSet, generate_state};
pub use verify::{Claims, Verifier, VerifyError};
