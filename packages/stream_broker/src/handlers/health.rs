use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns broker status
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime_secs = state.metrics.uptime_secs();

    match state.broker.stats().await {
        Ok(stats) => Json(metrics::HealthStatus {
            status: "healthy".to_string(),
            tracked_sessions: stats.tracked_sessions,
            active_streams: stats.active_streams,
            subscribers: stats.subscribers,
            uptime_secs,
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(metrics::HealthStatus {
                status: "unavailable".to_string(),
                tracked_sessions: 0,
                active_streams: 0,
                subscribers: 0,
                uptime_secs,
            }),
        )
            .into_response(),
    }
}

/// Metrics endpoint - returns detailed broker metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
