//! Dynamic client registration (RFC 7591)

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RegistrationConfig;
use crate::credentials::ClientCredential;
use crate::provider::ProviderMetadata;
use crate::{Error, Result};

/// Registration request body sent to the provider.
#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    redirect_uris: &'a [String],
    #[serde(skip_serializing_if = "str::is_empty")]
    client_name: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    contacts: &'a [String],
    grant_types: &'a [&'a str],
    response_types: &'a [&'a str],
    token_endpoint_auth_method: &'a str,
}

/// Registration response, the subset the gateway consumes.
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

/// Register a new confidential client with the provider.
///
/// # Errors
///
/// Returns [`Error::TransientProvider`] when the provider is unreachable or
/// answers with a server error, and [`Error::Config`] when the provider does
/// not support registration or rejects the request.
pub async fn register(
    client: &Client,
    metadata: &ProviderMetadata,
    registration: &RegistrationConfig,
    redirect_uris: &[String],
) -> Result<ClientCredential> {
    let Some(endpoint) = metadata.registration_endpoint.as_deref() else {
        return Err(Error::Config(format!(
            "Provider {} does not support dynamic client registration; \
             pre-register a client and add its credential with 'add-provider'",
            metadata.issuer
        )));
    };

    let request = RegistrationRequest {
        redirect_uris,
        client_name: &registration.client_name,
        contacts: &registration.contacts,
        grant_types: &["authorization_code"],
        response_types: &["code"],
        token_endpoint_auth_method: "client_secret_basic",
    };

    let response = client
        .post(endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::from_provider_request("Registration request failed", &e))?;

    let status = response.status();
    if status.is_server_error() {
        return Err(Error::TransientProvider(format!(
            "Registration at {endpoint} failed: HTTP {status}"
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Config(format!(
            "Registration at {endpoint} rejected: HTTP {status}: {body}"
        )));
    }

    let registered: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| Error::Config(format!("Malformed registration response: {e}")))?;

    info!(
        issuer = %metadata.issuer,
        client_id = %registered.client_id,
        "Registered OIDC client"
    );

    Ok(ClientCredential {
        client_id: registered.client_id,
        client_secret: registered.client_secret,
        redirect_uris: if registered.redirect_uris.is_empty() {
            redirect_uris.to_vec()
        } else {
            registered.redirect_uris
        },
    })
}
