//! Provider lifecycle management
//!
//! The [`ProviderManager`] owns one [`OidcClient`] per configured provider.
//! Clients are built in the background by the retry scheduler: providers
//! with a stored credential get a `Restore` task, the rest get a `Register`
//! task, and each provider bootstraps independently so one unreachable IdP
//! never delays the others. The gateway starts serving before any client is
//! ready; requests needing a provider that has not come up yet are simply
//! unauthenticated.
//!
//! The ready-client map is an `Arc` snapshot behind an `RwLock`: request
//! handlers clone the pointer and never block on a client install.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::credentials::{ClientCredential, CredentialStore};
use crate::provider::verify::{Claims, Verifier, unverified_issuer};
use crate::provider::{ProviderMetadata, registration};
use crate::scheduler::{RetryScheduler, TaskHandler, TaskKind};
use crate::{Error, Result};

/// Tokens returned by the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    /// Bearer access token for the userinfo endpoint
    pub access_token: String,
    /// ID token carrying the identity claims
    #[serde(default)]
    pub id_token: Option<String>,
    /// Token type, normally `Bearer`
    #[serde(default)]
    pub token_type: String,
}

/// A fully bootstrapped OIDC client for one provider.
pub struct OidcClient {
    /// Provider name from the configuration
    pub name: String,
    /// Discovered provider metadata
    pub metadata: ProviderMetadata,
    /// Registration credential
    pub credential: ClientCredential,
    /// Accepted `aud` values (the client id when none are configured)
    pub audiences: Vec<String>,
}

impl OidcClient {
    /// Build the authorization-endpoint URL for a login redirect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the discovered endpoint is not a valid
    /// URL.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        nonce: &str,
    ) -> Result<String> {
        let mut url = url::Url::parse(&self.metadata.authorization_endpoint).map_err(|e| {
            Error::Config(format!(
                "Provider '{}': invalid authorization endpoint: {e}",
                self.name
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.credential.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", "openid email profile")
            .append_pair("state", state)
            .append_pair("nonce", nonce);
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        let response = http
            .post(&self.metadata.token_endpoint)
            .basic_auth(
                &self.credential.client_id,
                Some(&self.credential.client_secret),
            )
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| Error::from_provider_request("Token request failed", &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "Token exchange with '{}' failed: HTTP {status}",
                self.name
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Config(format!("Malformed token response: {e}")))
    }

    /// Fetch the userinfo document with an access token.
    pub async fn userinfo(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<serde_json::Value> {
        let Some(endpoint) = self.metadata.userinfo_endpoint.as_deref() else {
            return Err(Error::Config(format!(
                "Provider '{}' has no userinfo endpoint",
                self.name
            )));
        };

        let response = http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::from_provider_request("Userinfo request failed", &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "Userinfo request to '{}' failed: HTTP {status}",
                self.name
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Config(format!("Malformed userinfo response: {e}")))
    }
}

/// Generate an unguessable URL-safe value for `state` and `nonce` params.
#[must_use]
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Owns provider bootstrap, the ready-client map, and token validation.
pub struct ProviderManager {
    config: Arc<Config>,
    http: reqwest::Client,
    verifier: Verifier,
    store: CredentialStore,
    credentials: parking_lot::Mutex<HashMap<String, ClientCredential>>,
    clients: parking_lot::RwLock<Arc<HashMap<String, Arc<OidcClient>>>>,
}

impl ProviderManager {
    /// Create the manager: hardens the credential directory and loads any
    /// stored credentials. No network traffic happens here.
    pub fn new(config: Arc<Config>, store: CredentialStore) -> Result<Self> {
        store.harden()?;
        let credentials = store.load()?;
        if !credentials.is_empty() {
            info!(providers = credentials.len(), "Loaded stored client credentials");
        }

        let http = reqwest::Client::builder()
            .timeout(config.server.request_timeout)
            .build()?;

        Ok(Self {
            config,
            verifier: Verifier::new(http.clone()),
            http,
            store,
            credentials: parking_lot::Mutex::new(credentials),
            clients: parking_lot::RwLock::new(Arc::new(HashMap::new())),
        })
    }

    /// Schedule one bootstrap task per configured provider and return
    /// immediately.
    pub fn bootstrap(self: &Arc<Self>, scheduler: &RetryScheduler) {
        for (name, provider) in &self.config.providers {
            let kind = if self.credentials.lock().contains_key(name) {
                TaskKind::Restore {
                    provider: name.clone(),
                }
            } else {
                TaskKind::Register {
                    provider: name.clone(),
                }
            };
            scheduler.schedule(
                std::time::Duration::ZERO,
                1,
                kind,
                self.config.retries_for(provider),
                self.config.retry_delay_for(provider),
            );
        }
    }

    /// The shared HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Snapshot of the ready-client map.
    #[must_use]
    pub fn clients(&self) -> Arc<HashMap<String, Arc<OidcClient>>> {
        Arc::clone(&self.clients.read())
    }

    /// Ready client for a provider name, if it has bootstrapped.
    #[must_use]
    pub fn client(&self, name: &str) -> Option<Arc<OidcClient>> {
        self.clients.read().get(name).cloned()
    }

    /// Number of providers that have completed bootstrap.
    #[must_use]
    pub fn ready(&self) -> usize {
        self.clients.read().len()
    }

    /// The redirect URI to use for a provider's login flow.
    #[must_use]
    pub fn redirect_uri_for(&self, name: &str) -> Option<String> {
        let provider = self.config.providers.get(name)?;
        self.config.redirect_uris_for(provider).into_iter().next()
    }

    /// Validate a bearer token against whichever ready provider issued it.
    ///
    /// Returns the claims on success and `None` for every failure mode:
    /// unknown issuer, provider not bootstrapped yet, bad signature, expired
    /// token. Validation never errors out of the request path.
    pub async fn validate(&self, token: &str) -> Option<Claims> {
        let issuer = unverified_issuer(token)?;

        let clients = self.clients();
        let client = clients
            .values()
            .find(|c| c.metadata.issuer == issuer)?;

        match self
            .verifier
            .verify(
                token,
                &client.metadata.issuer,
                &client.metadata.jwks_uri,
                &client.audiences,
            )
            .await
        {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!(issuer = %issuer, error = %e, "Token validation failed");
                None
            }
        }
    }

    /// Persist the in-memory credential map. Called after registration and
    /// once more at shutdown.
    pub fn flush(&self) -> Result<()> {
        let credentials = self.credentials.lock().clone();
        self.store.save(&credentials)
    }

    /// Provider config lookup keyed by task provider name.
    fn provider_config(&self, name: &str) -> Result<&crate::config::ProviderConfig> {
        self.config
            .providers
            .get(name)
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    /// Warm the verifier's JWKS cache for a provider. Token validation on
    /// the request path then only reads cached keys.
    async fn prefetch_jwks(&self, name: &str, metadata: &ProviderMetadata) -> Result<()> {
        self.verifier
            .prefetch(&metadata.issuer, &metadata.jwks_uri)
            .await
            .map_err(|e| {
                Error::TransientProvider(format!("JWKS fetch for provider '{name}' failed: {e}"))
            })
    }

    /// Install a ready client by swapping a new map snapshot in.
    fn install_client(&self, name: &str, metadata: ProviderMetadata, credential: ClientCredential) {
        let audiences = self
            .config
            .providers
            .get(name)
            .map(|p| p.audiences.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| vec![credential.client_id.clone()]);

        let client = Arc::new(OidcClient {
            name: name.to_string(),
            metadata,
            credential,
            audiences,
        });

        let mut guard = self.clients.write();
        let mut next = (**guard).clone();
        next.insert(name.to_string(), client);
        *guard = Arc::new(next);

        info!(provider = %name, "Provider ready");
    }
}

#[async_trait::async_trait]
impl TaskHandler for ProviderManager {
    async fn run(&self, kind: &TaskKind) -> Result<()> {
        match kind {
            TaskKind::Register { provider } => {
                let cfg = self.provider_config(provider)?;
                let metadata = ProviderMetadata::discover(&self.http, &cfg.issuer).await?;
                // Warm the JWKS cache before registering, so a fetch failure
                // retries without registering the client twice.
                self.prefetch_jwks(provider, &metadata).await?;
                let redirect_uris = self.config.redirect_uris_for(cfg);
                let credential = registration::register(
                    &self.http,
                    &metadata,
                    &cfg.registration,
                    &redirect_uris,
                )
                .await?;

                self.credentials
                    .lock()
                    .insert(provider.clone(), credential.clone());
                self.flush()?;

                self.install_client(provider, metadata, credential);
                Ok(())
            }
            TaskKind::Restore { provider } => {
                let cfg = self.provider_config(provider)?;
                let credential = self
                    .credentials
                    .lock()
                    .get(provider)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Config(format!("No stored credential for provider '{provider}'"))
                    })?;
                let metadata = ProviderMetadata::discover(&self.http, &cfg.issuer).await?;
                self.prefetch_jwks(provider, &metadata).await?;
                self.install_client(provider, metadata, credential);
                Ok(())
            }
        }
    }
}
