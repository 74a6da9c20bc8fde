use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics::HealthStatus;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    Json(HealthStatus {
        status: "healthy".to_string(),
        sessions: metrics.sessions.active,
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Every live session with its subscriber count and latest counters
pub async fn sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.sessions().await)
}
