//! WebSocket Handler
//!
//! One connection per tab. Outbound traffic comes from the broker through
//! the subscriber channel; inbound frames are decoded and dispatched.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerHandle;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;

use super::protocol::ClientMessage;

/// Handle a subscriber WebSocket connection
pub async fn handle_subscriber_ws(
    socket: WebSocket,
    broker: BrokerHandle,
    metrics: Arc<BrokerMetrics>,
) {
    let (subscriber, mut rx) = match broker.subscribe().await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Refusing WebSocket connection: {}", e);
            return;
        }
    };
    info!(%subscriber, "New subscriber WebSocket connection");
    metrics.subscriber_connected();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send messages to WebSocket. Ends when the broker drops this
    // subscriber (pruned, or shutting down) or the socket goes away.
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        // Let the tab know to reconnect and resync.
        let _ = ws_sender.send(Message::Close(None)).await;
    };

    // Task to handle incoming messages
    let input_broker = broker.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(%subscriber, "Ignoring unparseable client message: {}", e);
                            continue;
                        }
                    };
                    match input_broker.dispatch(subscriber, client_msg).await {
                        Ok(()) => {}
                        Err(BrokerError::Unavailable) => {
                            warn!(%subscriber, "Broker gone, closing connection");
                            break;
                        }
                        Err(e) => warn!(%subscriber, "Client message failed: {}", e),
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(%subscriber, "Client closed connection");
                    break;
                }
                Err(e) => {
                    error!(%subscriber, "WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(%subscriber, "Sender task ended"),
        _ = input_task => debug!(%subscriber, "Input task ended"),
    }

    let _ = broker.unsubscribe(subscriber).await;
    metrics.subscriber_disconnected();
    info!(%subscriber, "Subscriber disconnected");
}
