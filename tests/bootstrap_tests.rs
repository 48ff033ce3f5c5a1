//! Provider bootstrap tests
//!
//! Runs the real scheduler and provider manager against an in-process stub
//! IdP: registration persists a credential, restore reuses a stored one, and
//! an unreachable provider exhausts its retries without blocking anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::{get, post}};
use serde_json::json;

use oidc_gateway::config::{Config, ProviderConfig, RegistrationConfig};
use oidc_gateway::credentials::{ClientCredential, CredentialStore};
use oidc_gateway::provider::ProviderManager;
use oidc_gateway::scheduler::{RetryScheduler, TaskHandler};

struct StubIdp {
    issuer: String,
    registrations: Arc<AtomicU32>,
    jwks_fetches: Arc<AtomicU32>,
}

/// Serve a minimal OIDC provider: discovery, registration, JWKS.
async fn spawn_idp() -> StubIdp {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let issuer = format!("http://{}", listener.local_addr().unwrap());
    let registrations = Arc::new(AtomicU32::new(0));
    let jwks_fetches = Arc::new(AtomicU32::new(0));

    #[derive(Clone)]
    struct IdpState {
        issuer: String,
        registrations: Arc<AtomicU32>,
        jwks_fetches: Arc<AtomicU32>,
    }

    async fn discovery(State(state): State<IdpState>) -> Json<serde_json::Value> {
        let issuer = &state.issuer;
        Json(json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "userinfo_endpoint": format!("{issuer}/userinfo"),
            "registration_endpoint": format!("{issuer}/register"),
        }))
    }

    async fn register(State(state): State<IdpState>) -> Json<serde_json::Value> {
        let n = state.registrations.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "client_id": format!("client-{n}"),
            "client_secret": "s3cret",
        }))
    }

    async fn jwks(State(state): State<IdpState>) -> Json<serde_json::Value> {
        state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
        Json(json!({ "keys": [] }))
    }

    let router = Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/register", post(register))
        .route("/jwks", get(jwks))
        .with_state(IdpState {
            issuer: issuer.clone(),
            registrations: Arc::clone(&registrations),
            jwks_fetches: Arc::clone(&jwks_fetches),
        });

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    StubIdp {
        issuer,
        registrations,
        jwks_fetches,
    }
}

fn config_with_provider(issuer: &str, credentials_path: std::path::PathBuf) -> Config {
    let mut config = Config::default();
    config.providers.insert(
        "idp1".to_string(),
        ProviderConfig {
            issuer: issuer.to_string(),
            redirect_uris: Vec::new(),
            registration: RegistrationConfig {
                client_name: "oidc-gateway".to_string(),
                contacts: Vec::new(),
            },
            audiences: Vec::new(),
            retries: Some(2),
            retry_delay: Some(Duration::from_millis(20)),
        },
    );
    config.credentials.path = credentials_path;
    config
}

async fn wait_until_ready(manager: &ProviderManager, expected: usize) -> bool {
    for _ in 0..100 {
        if manager.ready() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn registration_bootstraps_and_persists_credential() {
    let idp = spawn_idp().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");
    let config = Arc::new(config_with_provider(&idp.issuer, path.clone()));

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path.clone())).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);

    assert!(wait_until_ready(&manager, 1).await, "provider never ready");
    assert_eq!(idp.registrations.load(Ordering::SeqCst), 1);

    // Credential hit the store
    let stored = CredentialStore::new(path).load().unwrap();
    assert_eq!(stored["idp1"].client_id, "client-0");
    assert!(!stored["idp1"].redirect_uris.is_empty());

    let client = manager.client("idp1").unwrap();
    assert_eq!(client.credential.client_id, "client-0");
    assert_eq!(client.metadata.issuer, idp.issuer);

    scheduler.cancel_all().await;
}

#[tokio::test]
async fn bootstrap_warms_the_jwks_cache() {
    let idp = spawn_idp().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");
    let config = Arc::new(config_with_provider(&idp.issuer, path.clone()));

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path)).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);

    assert!(wait_until_ready(&manager, 1).await, "provider never ready");
    // The keys were fetched during bootstrap, before any token arrived
    assert!(idp.jwks_fetches.load(Ordering::SeqCst) >= 1);

    scheduler.cancel_all().await;
}

#[tokio::test]
async fn stored_credential_is_restored_without_reregistration() {
    let idp = spawn_idp().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");
    let config = Arc::new(config_with_provider(&idp.issuer, path.clone()));

    // Pre-seed the store as if a previous run had registered
    let store = CredentialStore::new(path.clone());
    store.harden().unwrap();
    let mut creds = HashMap::new();
    creds.insert(
        "idp1".to_string(),
        ClientCredential {
            client_id: "stored-client".to_string(),
            client_secret: "stored-secret".to_string(),
            redirect_uris: vec!["https://localhost:8443/oidc-redirect".to_string()],
        },
    );
    store.save(&creds).unwrap();

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path)).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);

    assert!(wait_until_ready(&manager, 1).await, "provider never ready");
    // No registration call was made
    assert_eq!(idp.registrations.load(Ordering::SeqCst), 0);
    assert_eq!(
        manager.client("idp1").unwrap().credential.client_id,
        "stored-client"
    );

    scheduler.cancel_all().await;
}

#[tokio::test]
async fn unreachable_provider_exhausts_retries_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");
    // Port 9 (discard) refuses connections
    let config = Arc::new(config_with_provider("http://127.0.0.1:9", path.clone()));

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path)).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);

    // 1 attempt + 2 retries at 20ms spacing; give it time to drain
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.ready(), 0);
    assert_eq!(scheduler.pending(), 0);

    scheduler.cancel_all().await;
}

#[tokio::test]
async fn slow_provider_does_not_block_a_healthy_one() {
    let idp = spawn_idp().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");

    let mut config = config_with_provider(&idp.issuer, path.clone());
    config.providers.insert(
        "broken".to_string(),
        ProviderConfig {
            issuer: "http://127.0.0.1:9".to_string(),
            redirect_uris: Vec::new(),
            registration: RegistrationConfig::default(),
            audiences: Vec::new(),
            retries: Some(10),
            retry_delay: Some(Duration::from_millis(20)),
        },
    );
    let config = Arc::new(config);

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path)).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);

    // Healthy provider comes up while the broken one keeps retrying
    assert!(wait_until_ready(&manager, 1).await, "provider never ready");
    assert!(manager.client("idp1").is_some());
    assert!(manager.client("broken").is_none());

    scheduler.cancel_all().await;
}

#[tokio::test]
async fn flush_after_drain_persists_credentials() {
    let idp = spawn_idp().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("credentials.json");
    let config = Arc::new(config_with_provider(&idp.issuer, path.clone()));

    let manager = Arc::new(
        ProviderManager::new(Arc::clone(&config), CredentialStore::new(path.clone())).unwrap(),
    );
    let scheduler = RetryScheduler::start(Arc::clone(&manager) as Arc<dyn TaskHandler>);
    manager.bootstrap(&scheduler);
    assert!(wait_until_ready(&manager, 1).await, "provider never ready");

    // Shutdown order: drain, then flush
    scheduler.cancel_all().await;
    manager.flush().unwrap();

    let stored = CredentialStore::new(path).load().unwrap();
    assert!(stored.contains_key("idp1"));
}
