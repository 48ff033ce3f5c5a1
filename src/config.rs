//! Configuration management
//!
//! The whole gateway is driven by one [`Config`] struct, constructed once at
//! startup (YAML file merged with `OIDC_GATEWAY_` environment variables) and
//! passed by reference into each component constructor.

use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Identity providers, keyed by name
    pub providers: HashMap<String, ProviderConfig>,
    /// Proxied services, keyed by name
    pub services: HashMap<String, ServiceConfig>,
    /// Access-control policy configuration
    pub access_control: AccessControlConfig,
    /// Client credential persistence
    pub credentials: CredentialsConfig,
    /// Provider bootstrap retry policy
    pub retry: RetryConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Main (TLS) listener port
    pub port: u16,
    /// Optional plain-HTTP listener port (serves only the HTTPS redirect
    /// when `https_only` is set)
    pub plain_port: Option<u16>,
    /// External base URI of this gateway, e.g. `https://gateway.example.com`.
    /// Used to build redirect URIs and the plain-HTTP redirect target.
    pub base_uri: String,
    /// Redirect every plain-HTTP request to `base_uri`
    pub https_only: bool,
    /// Path of the session/token introspection endpoint
    pub auth_path: String,
    /// Paths (relative to `base_uri`) registered as OIDC redirect URIs
    pub redirect_paths: Vec<String>,
    /// TLS key/cert; when absent the main listener serves plain HTTP
    pub tls: Option<TlsConfig>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            plain_port: None,
            base_uri: "https://localhost:8443".to_string(),
            https_only: true,
            auth_path: "/auth".to_string(),
            redirect_paths: vec!["/oidc-redirect".to_string()],
            tls: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path
    pub certfile: PathBuf,
    /// PEM private key path
    pub keyfile: PathBuf,
}

/// A single OpenID Connect provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Issuer URL (discovery document is fetched from
    /// `<issuer>/.well-known/openid-configuration`)
    pub issuer: String,
    /// Redirect URIs registered for this provider; when empty, the global
    /// `server.redirect_paths` resolved against `base_uri` are used
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Dynamic registration metadata
    #[serde(default)]
    pub registration: RegistrationConfig,
    /// Accepted `aud` values (empty = accept the registered client id)
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Per-provider retry count override
    #[serde(default)]
    pub retries: Option<u32>,
    /// Per-provider retry delay override
    #[serde(default, with = "humantime_serde_opt")]
    pub retry_delay: Option<Duration>,
}

/// Metadata sent during dynamic client registration (RFC 7591)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Human-readable client name announced to the provider
    pub client_name: String,
    /// Operator contact addresses
    pub contacts: Vec<String>,
}

/// A proxied backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Origin to forward to. `http(s)://...` for a real backend, or the
    /// special values `pap` / `userinfo` for the built-in endpoints.
    pub origin: String,
    /// Path prefix this service is reachable under (e.g. `/svc1`)
    pub proxy_path: String,
    /// Whether requests must carry a valid session/token
    #[serde(default = "default_true")]
    pub authenticate: bool,
    /// Inject `x-auth-subject` / `x-auth-issuer` / `x-auth-claims` headers
    /// derived from the caller's claims
    #[serde(default)]
    pub pass_identity_headers: bool,
    /// Per-service forward timeout
    #[serde(default = "default_service_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ServiceConfig {
    /// Whether this entry names a built-in endpoint rather than a backend.
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        matches!(self.origin.as_str(), "pap" | "userinfo")
    }
}

/// Access-control policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccessControlConfig {
    /// Directories of JSON policy documents, loaded recursively in order
    pub json_dirs: Vec<PathBuf>,
}

/// Client credential persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Path of the credential store file. Its parent directory must be
    /// exclusive to the store.
    pub path: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/oidc-gateway/credentials.json"),
        }
    }
}

/// Provider bootstrap retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry count after the first attempt
    pub retries: u32,
    /// Fixed delay between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("OIDC_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.server.base_uri)
            .map_err(|e| Error::Config(format!("Invalid base_uri: {e}")))?;

        for (name, provider) in &self.providers {
            let issuer = url::Url::parse(&provider.issuer)
                .map_err(|e| Error::Config(format!("Provider '{name}': invalid issuer: {e}")))?;
            if issuer.scheme() != "https" && issuer.scheme() != "http" {
                return Err(Error::Config(format!(
                    "Provider '{name}': issuer must be an http(s) URL"
                )));
            }
        }

        for (name, service) in &self.services {
            if !service.proxy_path.starts_with('/') {
                return Err(Error::Config(format!(
                    "Service '{name}': proxy_path must start with '/'"
                )));
            }
            if !service.is_builtin() {
                url::Url::parse(&service.origin).map_err(|e| {
                    Error::Config(format!("Service '{name}': invalid origin: {e}"))
                })?;
            }
        }

        for path in &self.server.redirect_paths {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "Redirect path '{path}' must start with '/'"
                )));
            }
        }

        Ok(())
    }

    /// Effective retry count for a provider (per-provider override wins).
    #[must_use]
    pub fn retries_for(&self, provider: &ProviderConfig) -> u32 {
        provider.retries.unwrap_or(self.retry.retries)
    }

    /// Effective retry delay for a provider.
    #[must_use]
    pub fn retry_delay_for(&self, provider: &ProviderConfig) -> Duration {
        provider.retry_delay.unwrap_or(self.retry.delay)
    }

    /// Redirect URIs for a provider, falling back to the global paths
    /// resolved against `base_uri`.
    #[must_use]
    pub fn redirect_uris_for(&self, provider: &ProviderConfig) -> Vec<String> {
        if provider.redirect_uris.is_empty() {
            let base = self.server.base_uri.trim_end_matches('/');
            self.server
                .redirect_paths
                .iter()
                .map(|p| format!("{base}{p}"))
                .collect()
        } else {
            provider.redirect_uris.clone()
        }
    }

    /// A commented sample configuration, for `print-sample-config`.
    #[must_use]
    pub fn sample() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "example-idp".to_string(),
            ProviderConfig {
                issuer: "https://idp.example.com".to_string(),
                redirect_uris: Vec::new(),
                registration: RegistrationConfig {
                    client_name: "oidc-gateway".to_string(),
                    contacts: vec!["admin@example.com".to_string()],
                },
                audiences: Vec::new(),
                retries: None,
                retry_delay: None,
            },
        );

        let mut services = HashMap::new();
        services.insert(
            "svc1".to_string(),
            ServiceConfig {
                origin: "http://127.0.0.1:9000".to_string(),
                proxy_path: "/svc1".to_string(),
                authenticate: true,
                pass_identity_headers: true,
                timeout: default_service_timeout(),
            },
        );
        services.insert(
            "pap".to_string(),
            ServiceConfig {
                origin: "pap".to_string(),
                proxy_path: "/pap".to_string(),
                authenticate: true,
                pass_identity_headers: false,
                timeout: default_service_timeout(),
            },
        );
        services.insert(
            "userinfo".to_string(),
            ServiceConfig {
                origin: "userinfo".to_string(),
                proxy_path: "/userinfo".to_string(),
                authenticate: true,
                pass_identity_headers: false,
                timeout: default_service_timeout(),
            },
        );

        Self {
            server: ServerConfig::default(),
            providers,
            services,
            access_control: AccessControlConfig {
                json_dirs: vec![PathBuf::from("/etc/oidc-gateway/acl")],
            },
            credentials: CredentialsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| e.to_string())
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        }
    }
}

/// `humantime_serde` for `Option<Duration>` fields
pub mod humantime_serde_opt {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize an optional Duration
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format!("{}s", d.as_secs())),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| super::humantime_serde::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
