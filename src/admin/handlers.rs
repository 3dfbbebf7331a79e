use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use crate::http::server::AppState;
use crate::net::Limits;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub aggregate_limit: u64,
    pub conn_limit: u64,
}

/// Current caps, in bytes per second.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsResponse {
    pub aggregate_limit: u64,
    pub conn_limit: u64,
}

impl From<Limits> for LimitsResponse {
    fn from(limits: Limits) -> Self {
        Self {
            aggregate_limit: limits.aggregate(),
            conn_limit: limits.conn(),
        }
    }
}

/// Body of `PUT /admin/limits`. Omitted fields keep their value.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateLimits {
    pub aggregate_limit: Option<u64>,
    pub conn_limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let limits = state.shaper.limits();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_connections: state.shaper.active_count(),
        aggregate_limit: limits.aggregate(),
        conn_limit: limits.conn(),
    })
}

pub async fn get_limits(State(state): State<AppState>) -> Json<LimitsResponse> {
    Json(state.shaper.limits().into())
}

pub async fn put_limits(
    State(state): State<AppState>,
    Json(update): Json<UpdateLimits>,
) -> Result<Json<LimitsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let current = state.shaper.limits();
    let limits = Limits::new(
        update.aggregate_limit.unwrap_or(current.aggregate()),
        update.conn_limit.unwrap_or(current.conn()),
    )
    .map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;

    state.shaper.set_limits(limits);
    state.sync_shaping();
    tracing::info!(
        aggregate_limit = limits.aggregate(),
        conn_limit = limits.conn(),
        "Limits changed via admin API"
    );

    Ok(Json(limits.into()))
}
