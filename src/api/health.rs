use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use super::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Number of lines held in the in-memory Feature Store
    pub feature_store_lines: usize,
    /// Number of lines held in the static topology
    pub topology_lines: usize,
    /// Whether the Clock & Scheduler is currently paused
    pub scheduler_paused: bool,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let feature_store = state.feature_store.read().await.clone();
    let topology = state.topology.read().await.clone();

    Json(HealthResponse {
        healthy: true,
        feature_store_lines: feature_store.line_count(),
        topology_lines: topology.line_codes().count(),
        scheduler_paused: state.scheduler.is_paused(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
