use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// Subscriber WebSocket - one per open tab, carrying every session's events
pub async fn subscriber_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let broker = state.broker.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| ws::handle_subscriber_ws(socket, broker, metrics))
}
