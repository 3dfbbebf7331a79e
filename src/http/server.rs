//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the download and health handlers
//! - Serve it over a [`ShapedListener`] so every response body is paced
//! - Apply configuration updates from the file watcher
//! - Stop accepting on shutdown and let in-flight downloads finish

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::lifecycle::shutdown::recv_shutdown;
use crate::net::{ShapedListener, Shaper};

/// `Content-Disposition` of the download body.
pub const DOWNLOAD_DISPOSITION: &str = "inline; filename=\"myfile.txt\"";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration snapshot.
    pub config: Arc<ArcSwap<ServerConfig>>,
    /// Shaping state of the public listener.
    pub shaper: Shaper,
    /// When the server was created.
    pub started_at: Instant,
}

impl AppState {
    /// Build state around an existing shaper.
    pub fn new(config: ServerConfig, shaper: Shaper) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            shaper,
            started_at: Instant::now(),
        }
    }

    /// Accept a reloaded configuration.
    ///
    /// Caps are pushed into the shaper first; a configuration whose caps are
    /// rejected is dropped whole.
    pub fn apply_config(&self, new_config: ServerConfig) {
        match new_config.shaping.limits() {
            Ok(limits) => {
                let limits_changed = self.shaper.set_limits(limits);
                tracing::info!(
                    limits_changed,
                    aggregate_limit = limits.aggregate(),
                    conn_limit = limits.conn(),
                    payload_bytes = new_config.payload.size_bytes,
                    "Configuration applied"
                );
                self.config.store(Arc::new(new_config));
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected configuration update");
            }
        }
    }

    /// Record caps changed at runtime in the configuration snapshot.
    pub fn sync_shaping(&self) {
        let limits = self.shaper.limits();
        self.config.rcu(|current| {
            let mut next = ServerConfig::clone(current);
            next.shaping.aggregate_limit = limits.aggregate();
            next.shaping.conn_limit = limits.conn();
            next
        });
    }
}

/// HTTP server for the shaped download endpoint.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server serving through `shaper`'s listener.
    pub fn new(config: ServerConfig, shaper: Shaper) -> Self {
        let state = AppState::new(config, shaper);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/download", get(download_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Shared state, for the admin API.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: ShapedListener,
        mut config_updates: mpsc::UnboundedReceiver<ServerConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let state = self.state.clone();
        let updates = tokio::spawn(async move {
            while let Some(new_config) = config_updates.recv().await {
                state.apply_config(new_config);
            }
        });

        let result = axum::serve(listener, self.router)
            .with_graceful_shutdown(recv_shutdown(shutdown))
            .await;

        updates.abort();
        tracing::info!("HTTP server stopped");
        result
    }
}

/// Serve `payload.size_bytes` zero bytes.
async fn download_handler(State(state): State<AppState>) -> Response {
    let size = state.config.load().payload.size_bytes;
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CONTENT_DISPOSITION, DOWNLOAD_DISPOSITION),
        ],
        Body::from(vec![0u8; size]),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: state.shaper.active_count(),
    })
}
