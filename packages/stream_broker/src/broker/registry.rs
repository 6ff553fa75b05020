//! Subscriber Registry
//!
//! Connected tabs, each behind a bounded channel drained by its WebSocket
//! sender task. A send that fails (channel full or closed) removes the
//! subscriber on the spot; dropping its sender closes the socket.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ws::ServerMessage;

/// Process-unique handle for a connected tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What became of a targeted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The send failed and the subscriber was removed.
    Pruned,
    /// No such subscriber (already pruned or unregistered).
    Unknown,
}

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    last_ack: Instant,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    next_id: u64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tx: mpsc::Sender<ServerMessage>, now: Instant) -> SubscriberId {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        self.subscribers.insert(id, Subscriber { tx, last_ack: now });
        id
    }

    pub fn unregister(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Record a heartbeat acknowledgment. Unknown ids are ignored.
    pub fn acknowledge(&mut self, id: SubscriberId, now: Instant) {
        if let Some(subscriber) = self.subscribers.get_mut(&id) {
            subscriber.last_ack = now;
        }
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Send to every subscriber, pruning the ones whose send fails.
    /// Returns how many were pruned.
    pub fn broadcast(&mut self, message: &ServerMessage) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|id, subscriber| {
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(subscriber = %id, "pruning subscriber after failed send: {}", e);
                    false
                }
            }
        });
        before - self.subscribers.len()
    }

    /// Send to one subscriber. A failed send prunes it.
    pub fn send_to(&mut self, id: SubscriberId, message: ServerMessage) -> Delivery {
        let Some(subscriber) = self.subscribers.get(&id) else {
            return Delivery::Unknown;
        };
        match subscriber.tx.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                warn!(subscriber = %id, "pruning subscriber after failed send: {}", e);
                self.subscribers.remove(&id);
                Delivery::Pruned
            }
        }
    }

    /// Ping everyone, first dropping subscribers silent for longer than
    /// `ack_timeout`. `None` disables the timeout. Returns how many were pruned.
    pub fn heartbeat(&mut self, now: Instant, ack_timeout: Option<Duration>) -> usize {
        let mut pruned = 0;
        if let Some(timeout) = ack_timeout {
            let before = self.subscribers.len();
            self.subscribers.retain(|id, subscriber| {
                let silent_for = now.saturating_duration_since(subscriber.last_ack);
                if silent_for > timeout {
                    debug!(subscriber = %id, "no heartbeat ack for {:?}, pruning", silent_for);
                    false
                } else {
                    true
                }
            });
            pruned = before - self.subscribers.len();
        }
        pruned + self.broadcast(&ServerMessage::HeartbeatPing)
    }
}
