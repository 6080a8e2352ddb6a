//! Daemon mode for the SkyLink VPN service
//!
//! Serves the REST API for a UI process and keeps the reconciliation loop
//! running for as long as the daemon is up.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::service::VpnService;

use routes::{build_router, AppState};

/// Daemon service exposing [`VpnService`] over HTTP on localhost
pub struct DaemonService {
    service: Arc<VpnService>,
}

impl DaemonService {
    pub fn new(service: VpnService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// Run the REST API until Ctrl+C or SIGTERM.
    ///
    /// The reconciliation loop is started before the listener and stopped
    /// after it has drained.
    pub async fn run_http(&self, port: u16) -> Result<()> {
        let reconciler = self.service.spawn_reconciler();

        let app = build_router(AppState {
            service: Arc::clone(&self.service),
        })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("REST API listening on http://{}", addr);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        reconciler.stop().await;
        tracing::info!("Daemon stopped");
        served?;
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down daemon..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down daemon..."),
    }
}
