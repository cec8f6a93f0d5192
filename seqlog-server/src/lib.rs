//! Sequence Log Server - the service process
//!
//! Runs the collector from `seqlog-core` and an embedded web server for
//! live viewers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    SeqLogServer                       │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │       seqlog-core::ServiceHandle               │  │
//! │  │   (collector, call trees, sinks)               │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                        │                              │
//! │   ┌──────────────┬─────┴────────┬─────────────┐       │
//! │   ▼              ▼              ▼             ▼       │
//! │ /health      /v1/stats      /v1/logs     /v1/stream   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod routes;
mod error;

pub use error::StartupError;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use seqlog_core::{ServiceHandle, ServiceStats};

/// Shared application state
pub struct AppState {
    /// The running collector
    pub service: ServiceHandle,
}

impl AppState {
    pub fn new(service: ServiceHandle) -> Self {
        Self { service }
    }
}

/// Web front of a running sequence log service
pub struct SeqLogServer {
    state: Arc<AppState>,
    port: u16,
    cors_enabled: bool,
}

impl SeqLogServer {
    /// Serve `service` on `port` (`WEB_SERVER_PORT`), CORS allowed
    pub fn new(service: ServiceHandle, port: u16) -> Self {
        Self {
            state: Arc::new(AppState::new(service)),
            port,
            cors_enabled: true,
        }
    }

    /// Allow the live view to be embedded from other origins
    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    /// Build the Axum router with all routes
    pub fn router(&self) -> Router {
        routes::create_router(Arc::clone(&self.state), self.cors_enabled)
    }

    /// Get the socket address for the server
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<(), StartupError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = self.addr();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::WebServer { addr, source })?;

        tracing::info!("Sequence log web server listening on http://{}", addr);
        tracing::info!("Endpoints:");
        tracing::info!("  GET  /health");
        tracing::info!("  GET  /v1/stats");
        tracing::info!("  GET  /v1/logs");
        tracing::info!("  GET  /v1/logs/:name");
        tracing::info!("  GET  /v1/stream (WebSocket)");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(StartupError::Serve)
    }

    /// Stop the collector once the web server is done
    ///
    /// Live viewer connections still holding the state keep the service
    /// alive until they drop; the handle then stops it on drop.
    pub async fn shutdown(self) -> Option<ServiceStats> {
        let state = Arc::try_unwrap(self.state).ok()?;
        tokio::task::spawn_blocking(move || state.service.shutdown())
            .await
            .ok()
    }
}
