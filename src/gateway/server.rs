//! Gateway server
//!
//! Startup wires the components together, schedules provider bootstrap, and
//! starts serving immediately: providers come up in the background and a
//! request that needs a not-yet-ready provider is simply unauthenticated.
//!
//! Shutdown order matters: stop accepting requests, drain the scheduler
//! (`cancel_all` joins the worker, so no registration can race the flush),
//! then persist the credential store one final time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::handlers::{AppState, create_redirect_router, create_router};
use super::routes::RouteTable;
use super::session::SessionStore;
use crate::ac::PolicyStore;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::provider::ProviderManager;
use crate::scheduler::RetryScheduler;
use crate::{Error, Result};

/// Default lifetime of a login session.
const SESSION_TTL: Duration = Duration::from_secs(8 * 3600);

/// OIDC gateway server
pub struct Gateway {
    config: Arc<Config>,
    providers: Arc<ProviderManager>,
    policies: Arc<PolicyStore>,
    routes: Arc<RouteTable>,
}

impl Gateway {
    /// Assemble the gateway: loads credentials and the policy tree, builds
    /// the route table. No network traffic happens here.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = CredentialStore::new(config.credentials.path.clone());
        let providers = Arc::new(ProviderManager::new(Arc::clone(&config), store)?);

        let policies = Arc::new(PolicyStore::new());
        if config.access_control.json_dirs.is_empty() {
            warn!("No policy directories configured; every request will be denied");
        } else {
            let rules = policies.load_dirs(&config.access_control.json_dirs)?;
            info!(rules, "Loaded access-control policies");
        }

        let routes = Arc::new(RouteTable::build(&config)?);

        Ok(Self {
            config,
            providers,
            policies,
            routes,
        })
    }

    /// Run the gateway until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let scheduler = Arc::new(RetryScheduler::start(
            Arc::clone(&self.providers) as Arc<dyn crate::scheduler::TaskHandler>
        ));
        self.providers.bootstrap(&scheduler);
        info!(
            providers = self.config.providers.len(),
            "Provider bootstrap scheduled"
        );

        let state = Arc::new(AppState {
            config: Arc::clone(&self.config),
            providers: Arc::clone(&self.providers),
            policies: Arc::clone(&self.policies),
            sessions: Arc::new(SessionStore::new(SESSION_TTL)),
            routes: Arc::clone(&self.routes),
        });
        let app = create_router(state);

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        {
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = shutdown_tx.send(());
            });
        }

        // Plain-HTTP listener: only the redirect to the external base URI
        let plain_task = if let (Some(plain_port), true) =
            (self.config.server.plain_port, self.config.server.https_only)
        {
            let addr = self.listen_addr(plain_port)?;
            let redirect = create_redirect_router(self.config.server.base_uri.clone());
            let mut shutdown_rx = shutdown_tx.subscribe();
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, "Plain-HTTP redirect listener up");
            Some(tokio::spawn(async move {
                let result = axum::serve(listener, redirect)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "Plain-HTTP listener failed");
                }
            }))
        } else {
            None
        };

        let addr = self.listen_addr(self.config.server.port)?;
        info!("============================================================");
        info!("OIDC GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %addr, base_uri = %self.config.server.base_uri, "Listening");
        info!(services = self.config.services.len(), "Routes configured");

        if let Some(tls) = &self.config.server.tls {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.certfile,
                &tls.keyfile,
            )
            .await
            .map_err(|e| Error::Config(format!("TLS setup failed: {e}")))?;

            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let _ = shutdown_rx.recv().await;
                    handle.graceful_shutdown(Some(Duration::from_secs(10)));
                });
            }

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        } else {
            warn!("TLS not configured; main listener serves plain HTTP");
            let listener = TcpListener::bind(addr).await?;
            let mut shutdown_rx = shutdown_tx.subscribe();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        if let Some(task) = plain_task {
            let _ = task.await;
        }

        // Drain before flushing so no in-flight registration races the save
        info!("Draining scheduler...");
        scheduler.cancel_all().await;
        self.providers.flush()?;
        info!("Shutdown complete");

        Ok(())
    }

    fn listen_addr(&self, port: u16) -> Result<SocketAddr> {
        let host = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
        Ok(SocketAddr::new(host, port))
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
