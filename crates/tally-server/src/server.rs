//! Tally server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tally_core::MetricStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditPublisher;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::persist::PersistenceSync;
use crate::routes::create_router;
use crate::state::AppState;
use crate::trust::TrustPolicy;

/// Metrics collector server.
#[derive(Debug)]
pub struct TallyServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl TallyServer {
    /// Creates a server around existing state.
    #[must_use]
    pub const fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Builds the store, persistence, audit and trust settings from the
    /// configuration, restoring the last snapshot when `restore` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached, the snapshot
    /// cannot be read, the audit file cannot be opened or the private key
    /// cannot be loaded.
    pub async fn from_config(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store = MetricStore::new();
        let persistence = PersistenceSync::from_config(&config, store.clone()).await?;
        if config.restore && persistence.is_enabled() {
            let restored = persistence.restore().await?;
            info!(restored, sink = ?persistence.sink_name(), "snapshot restored");
        }

        let audit = AuditPublisher::from_config(&config)?;
        let trust = TrustPolicy::from_config(&config)?;
        info!(
            persistence = ?persistence.mode(),
            sink = ?persistence.sink_name(),
            audit = ?audit,
            trust = ?trust,
            "server configured"
        );

        let state = Arc::new(AppState::new(store, persistence, audit, trust));
        Ok(Self::new(config, state))
    }

    /// Returns the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start the server and listen for connections.
    ///
    /// This method runs until the server encounters a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve(&self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// When `shutdown` completes, in-flight requests finish, the periodic
    /// snapshot task stops and the last snapshot is written.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = listen_address(&self.config.address);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ServerError::BindFailed(address.clone(), e))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails while running.
    pub async fn serve_on<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, "tally server listening");

        let snapshots = CancellationToken::new();
        let snapshot_task = self.state.persistence.spawn_interval(snapshots.clone());

        let router = create_router(self.state());
        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()));

        snapshots.cancel();
        if let Some(task) = snapshot_task {
            if let Err(e) = task.await {
                warn!(error = %e, "snapshot task ended abnormally");
            }
        }

        served?;
        info!("tally server shut down");
        Ok(())
    }

    /// Create the router without starting the server.
    ///
    /// Useful for testing or embedding in another server.
    pub fn router(&self) -> axum::Router {
        create_router(self.state())
    }
}

/// Expands a bare `:port` into an all-interfaces address.
fn listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}
