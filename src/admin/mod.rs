//! Admin API for inspecting and adjusting the caps at runtime.
//!
//! # Endpoints
//! - `GET /admin/status`: version, uptime, active connections, caps
//! - `GET /admin/limits`: current caps
//! - `PUT /admin/limits`: change either cap; zero is rejected with 400
//!
//! Every endpoint requires `Authorization: Bearer <admin.api_key>`.

pub mod handlers;
pub mod auth;

use axum::{
    routing::get,
    Router,
    middleware,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use crate::http::server::AppState;
use crate::lifecycle::shutdown::recv_shutdown;
use self::handlers::*;
use self::auth::admin_auth_middleware;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/limits", get(get_limits).put(put_limits))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    tracing::info!(address = %listener.local_addr()?, "Admin API starting");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(recv_shutdown(shutdown))
        .await
}
