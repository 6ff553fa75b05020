//! Shared fixtures: a fake agent endpoint served by axum on a free port.

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stream_broker::ws::ServerMessage;
use stream_broker::{Broker, BrokerConfig, BrokerHandle, BrokerMetrics, HttpUpstream};

#[derive(Debug, Deserialize)]
pub struct Turn {
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn sse(event: &str, payload: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, payload)
}

fn event_stream(body: impl Into<Body>) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body.into()).into_response()
}

/// Echoes the turn back: title, two chunks around a tool call, then done.
async fn echo(Json(turn): Json<Turn>) -> Response {
    let model = turn.model.unwrap_or_else(|| "default".to_string());
    let body = [
        sse("title", json!({ "title": format!("Chat {}", turn.session_id) })),
        sse("chunk", json!({ "content": "echo: " })),
        sse("tool_start", json!({ "name": "Read", "id": "t1" })),
        sse("tool_end", json!({ "name": "Read", "id": "t1", "input": { "path": "a.rs" } })),
        // No event line: the type stays tool_end, so this frame is skipped.
        format!("data: {}\n\n", json!({ "content": "ignored" })),
        sse("chunk", json!({ "content": format!("{} ({})", turn.content, model) })),
        ": keep-alive\n\n".to_string(),
        sse("done", json!({ "messageId": format!("msg-{}", turn.session_id) })),
    ]
    .concat();
    event_stream(body)
}

/// Sends one chunk, then keeps the connection open forever.
async fn hang(Json(_turn): Json<Turn>) -> Response {
    let first = futures::stream::once(async {
        Ok::<_, std::io::Error>(sse("chunk", json!({ "content": "thinking" })))
    });
    let stream = futures::StreamExt::chain(first, futures::stream::pending());
    event_stream(Body::from_stream(stream))
}

async fn fail() -> Response {
    (StatusCode::BAD_GATEWAY, "agent offline").into_response()
}

/// Start the fake agent; returns its base URL.
pub async fn spawn_agent() -> String {
    let app = Router::new()
        .route("/echo", post(echo))
        .route("/hang", post(hang))
        .route("/fail", post(fail));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn spawn_broker(upstream_url: &str, config: BrokerConfig) -> (BrokerHandle, Arc<BrokerMetrics>) {
    let upstream = HttpUpstream::new(upstream_url, Duration::from_secs(2)).unwrap();
    let metrics = Arc::new(BrokerMetrics::new());
    let broker = Broker::spawn(config, Arc::new(upstream), metrics.clone());
    (broker, metrics)
}

/// Next non-heartbeat message, failing the test after five seconds.
pub async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for broadcast")
            .expect("subscriber channel closed");
        if message != ServerMessage::HeartbeatPing {
            return message;
        }
    }
}

/// Collect messages up to and including the next `STREAM_END`.
pub async fn until_stream_end(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    loop {
        let message = next(rx).await;
        let done = matches!(message, ServerMessage::StreamEnd { .. });
        out.push(message);
        if done {
            return out;
        }
    }
}
