//! Session stream broker.
//!
//! A long-lived process shared by every open tab of the dashboard. It owns at
//! most one upstream event stream per chat session, fans each event out to
//! all connected tabs, keeps enough per-session state for a late tab to
//! resynchronize, and bounds its own resource use.

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod upstream;
pub mod ws;

#[cfg(test)]
mod test_helpers;

pub use broker::{Broker, BrokerHandle, BrokerStats};
pub use config::{BrokerConfig, FileConfig, ServerConfig};
pub use error::{BrokerError, StartRejection, UpstreamError};
pub use metrics::BrokerMetrics;
pub use upstream::{HttpUpstream, StartRequest, UpstreamConnector};

/// Shared state for the HTTP routes
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub metrics: Arc<BrokerMetrics>,
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/ws", get(handlers::subscriber_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
