//! Session Stream Broker
//!
//! One task owns every session, every subscriber and the resource governor.
//! Commands from WebSocket handlers, adapter output and timer ticks are all
//! handled inside that task, one at a time and without awaiting, so no two
//! handlers ever observe each other's half-finished mutations.
//!
//! Callers talk to it through a cloneable [`BrokerHandle`].

mod governor;
mod processor;
mod registry;
mod state;

pub use governor::{Limits, ResourceGovernor};
pub use registry::{Delivery, SubscriberId, SubscriberRegistry};
pub use state::{
    Segment, SessionSnapshot, SessionState, SessionStore, ToolHandle, TurnPhase,
    UpstreamAttachment,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, StartRejection};
use crate::metrics::BrokerMetrics;
use crate::upstream::{
    AdapterEvent, AdapterMessage, StartRequest, StreamOutcome, UpstreamConnector, spawn_adapter,
};
use crate::ws::{ClientMessage, ServerMessage};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const ADAPTER_CHANNEL_CAPACITY: usize = 1024;

/// Commands that can be sent to the broker task
#[derive(Debug)]
pub enum BrokerCommand {
    Subscribe {
        respond_to: oneshot::Sender<(SubscriberId, mpsc::Receiver<ServerMessage>)>,
    },
    Unsubscribe {
        subscriber: SubscriberId,
    },
    Start {
        /// Who to tell about a rejection. `None` for in-process callers.
        subscriber: Option<SubscriberId>,
        request: StartRequest,
        respond_to: oneshot::Sender<Result<(), StartRejection>>,
    },
    Stop {
        session_id: String,
        respond_to: oneshot::Sender<bool>,
    },
    /// The sync message is also sent to `subscriber`, if given, in order with
    /// its other traffic.
    GetState {
        subscriber: Option<SubscriberId>,
        session_id: Option<String>,
        respond_to: oneshot::Sender<ServerMessage>,
    },
    ClearState {
        session_id: String,
        respond_to: oneshot::Sender<()>,
    },
    HeartbeatAck {
        subscriber: SubscriberId,
    },
    Stats {
        respond_to: oneshot::Sender<BrokerStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Point-in-time counts for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub tracked_sessions: usize,
    pub active_streams: usize,
    pub subscribers: usize,
}

/// Handle to communicate with the broker task
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| BrokerError::Unavailable)?;
        rx.await.map_err(|_| BrokerError::Unavailable)
    }

    async fn notify(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| BrokerError::Unavailable)
    }

    /// Register a tab. The receiver starts with a `STATE_SYNC` listing the
    /// active sessions.
    pub async fn subscribe(
        &self,
    ) -> Result<(SubscriberId, mpsc::Receiver<ServerMessage>), BrokerError> {
        self.request(|respond_to| BrokerCommand::Subscribe { respond_to })
            .await
    }

    pub async fn unsubscribe(&self, subscriber: SubscriberId) -> Result<(), BrokerError> {
        self.notify(BrokerCommand::Unsubscribe { subscriber }).await
    }

    /// Start (or restart) a turn. A refusal is also sent to `subscriber`.
    pub async fn start(
        &self,
        subscriber: Option<SubscriberId>,
        request: StartRequest,
    ) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::Start {
            subscriber,
            request,
            respond_to,
        })
        .await?
        .map_err(BrokerError::from)
    }

    /// Abort a live stream. Returns false if the session was not streaming.
    pub async fn stop(&self, session_id: impl Into<String>) -> Result<bool, BrokerError> {
        let session_id = session_id.into();
        self.request(|respond_to| BrokerCommand::Stop {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(
        &self,
        subscriber: Option<SubscriberId>,
        session_id: Option<String>,
    ) -> Result<ServerMessage, BrokerError> {
        self.request(|respond_to| BrokerCommand::GetState {
            subscriber,
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn clear_state(&self, session_id: impl Into<String>) -> Result<(), BrokerError> {
        let session_id = session_id.into();
        self.request(|respond_to| BrokerCommand::ClearState {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn acknowledge_heartbeat(&self, subscriber: SubscriberId) -> Result<(), BrokerError> {
        self.notify(BrokerCommand::HeartbeatAck { subscriber }).await
    }

    /// Route a decoded client frame. Rejected starts are already reported to
    /// the subscriber, so they are not errors here.
    pub async fn dispatch(
        &self,
        subscriber: SubscriberId,
        message: ClientMessage,
    ) -> Result<(), BrokerError> {
        match message {
            ClientMessage::Start {
                session_id,
                content,
                model_override,
            } => {
                let request = StartRequest {
                    session_id,
                    content,
                    model_override,
                };
                match self.start(Some(subscriber), request).await {
                    Ok(()) | Err(BrokerError::Rejected(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::Stop { session_id } => self.stop(session_id).await.map(|_| ()),
            ClientMessage::GetState { session_id } => self
                .get_state(Some(subscriber), session_id)
                .await
                .map(|_| ()),
            ClientMessage::ClearState { session_id } => self.clear_state(session_id).await,
            ClientMessage::HeartbeatAck => self.acknowledge_heartbeat(subscriber).await,
        }
    }

    pub async fn stats(&self) -> Result<BrokerStats, BrokerError> {
        self.request(|respond_to| BrokerCommand::Stats { respond_to })
            .await
    }

    /// Abort every live stream and stop the broker task.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.request(|respond_to| BrokerCommand::Shutdown { respond_to })
            .await
    }
}

pub struct Broker {
    config: BrokerConfig,
    store: SessionStore,
    registry: SubscriberRegistry,
    governor: ResourceGovernor,
    connector: Arc<dyn UpstreamConnector>,
    metrics: Arc<BrokerMetrics>,
    commands: mpsc::Receiver<BrokerCommand>,
    adapter_tx: mpsc::Sender<AdapterMessage>,
    adapter_rx: mpsc::Receiver<AdapterMessage>,
    next_generation: u64,
}

impl Broker {
    pub fn spawn(
        config: BrokerConfig,
        connector: Arc<dyn UpstreamConnector>,
        metrics: Arc<BrokerMetrics>,
    ) -> BrokerHandle {
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (adapter_tx, adapter_rx) = mpsc::channel(ADAPTER_CHANNEL_CAPACITY);

        let broker = Broker {
            governor: ResourceGovernor::new(config.limits.clone()),
            config,
            store: SessionStore::new(),
            registry: SubscriberRegistry::new(),
            connector,
            metrics,
            commands,
            adapter_tx,
            adapter_rx,
            next_generation: 0,
        };
        tokio::spawn(broker.run());

        BrokerHandle { sender }
    }

    async fn run(mut self) {
        info!(
            max_streams = self.config.limits.max_concurrent_streams,
            max_sessions = self.config.limits.max_tracked_sessions,
            "broker started"
        );

        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut idle_sweep = ticker(self.config.idle_sweep_interval);
        let mut cap_sweep = ticker(self.config.session_cap_sweep_interval);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(BrokerCommand::Shutdown { respond_to }) => {
                        self.shutdown();
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(message) = self.adapter_rx.recv() => self.handle_adapter(message),
                _ = heartbeat.tick() => self.heartbeat(),
                _ = idle_sweep.tick() => {
                    let evicted = self.governor.sweep_idle(&mut self.store, Instant::now());
                    self.metrics.sessions_evicted_idle(evicted.len());
                }
                _ = cap_sweep.tick() => {
                    let evicted = self.governor.sweep_over_capacity(&mut self.store);
                    self.metrics.sessions_evicted_capacity(evicted.len());
                }
            }
        }

        info!("broker stopped");
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Subscribe { respond_to } => {
                let (tx, rx) = mpsc::channel(self.config.subscriber_channel_capacity);
                let id = self.registry.register(tx, Instant::now());
                debug!(subscriber = %id, "subscriber registered");
                let sync = self.state_sync(None);
                self.send_to(id, sync);
                let _ = respond_to.send((id, rx));
            }
            BrokerCommand::Unsubscribe { subscriber } => {
                if self.registry.unregister(subscriber) {
                    debug!(%subscriber, "subscriber unregistered");
                }
            }
            BrokerCommand::Start {
                subscriber,
                request,
                respond_to,
            } => {
                let result = self.start(subscriber, request);
                let _ = respond_to.send(result);
            }
            BrokerCommand::Stop {
                session_id,
                respond_to,
            } => {
                let stopped = self.abort(&session_id);
                if stopped {
                    info!(%session_id, "stream stopped by request");
                } else {
                    self.store.touch(&session_id, Instant::now());
                }
                let _ = respond_to.send(stopped);
            }
            BrokerCommand::GetState {
                subscriber,
                session_id,
                respond_to,
            } => {
                let sync = self.state_sync(session_id.as_deref());
                if let Some(id) = subscriber {
                    self.send_to(id, sync.clone());
                }
                let _ = respond_to.send(sync);
            }
            BrokerCommand::ClearState {
                session_id,
                respond_to,
            } => {
                self.clear(&session_id);
                let _ = respond_to.send(());
            }
            BrokerCommand::HeartbeatAck { subscriber } => {
                self.registry.acknowledge(subscriber, Instant::now());
            }
            BrokerCommand::Stats { respond_to } => {
                let _ = respond_to.send(BrokerStats {
                    tracked_sessions: self.store.len(),
                    active_streams: self.store.streaming_count(),
                    subscribers: self.registry.len(),
                });
            }
            // Handled by the run loop.
            BrokerCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn start(
        &mut self,
        subscriber: Option<SubscriberId>,
        request: StartRequest,
    ) -> Result<(), StartRejection> {
        let session_id = request.session_id.clone();

        if let Err(rejection) = self.governor.admit(&self.store, &session_id) {
            warn!(%session_id, "rejecting start: {}", rejection);
            self.metrics.stream_rejected();
            if let Some(id) = subscriber {
                let StartRejection::ConcurrencyLimit { active, max } = rejection.clone();
                self.send_to(
                    id,
                    ServerMessage::StartRejected {
                        session_id,
                        reason: rejection.to_string(),
                        active,
                        max,
                    },
                );
            }
            return Err(rejection);
        }

        // One upstream per session: tear the old one down first.
        if self.abort(&session_id) {
            info!(%session_id, "restarting stream");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let state = self.store.get(&session_id, Instant::now());
        let announce = processor::begin_turn(
            &session_id,
            state,
            UpstreamAttachment {
                generation,
                cancel: cancel.clone(),
            },
        );
        self.broadcast(announce);
        self.metrics.stream_started();

        info!(%session_id, generation, "stream starting");
        spawn_adapter(
            self.connector.clone(),
            request,
            generation,
            cancel,
            self.adapter_tx.clone(),
            self.metrics.clone(),
        );
        Ok(())
    }

    /// Finalize a live stream as aborted. False when nothing was streaming.
    fn abort(&mut self, session_id: &str) -> bool {
        let Some(state) = self.store.peek_mut(session_id) else {
            return false;
        };
        if !state.is_streaming() {
            return false;
        }
        let messages = processor::finalize(session_id, state, &StreamOutcome::Aborted, Instant::now());
        self.record_outcome(&StreamOutcome::Aborted);
        self.broadcast_all(messages);
        true
    }

    fn clear(&mut self, session_id: &str) {
        self.abort(session_id);
        if self.store.evict(session_id).is_some() {
            info!(%session_id, "session cleared");
        }
        let active_session_ids = self.store.streaming_ids();
        self.broadcast(ServerMessage::StateSync {
            session_id: Some(session_id.to_string()),
            state: None,
            active_session_ids,
        });
    }

    fn handle_adapter(&mut self, message: AdapterMessage) {
        let AdapterMessage {
            session_id,
            generation,
            event,
        } = message;

        let now = Instant::now();
        let Some(state) = self.store.peek_mut(&session_id) else {
            debug!(%session_id, generation, "dropping adapter output for evicted session");
            return;
        };
        let current = state.upstream.as_ref().map(|a| a.generation);
        if current != Some(generation) {
            debug!(%session_id, generation, ?current, "dropping stale adapter output");
            return;
        }
        state.last_activity = now;

        match event {
            AdapterEvent::Frame(event) => {
                self.metrics.frame_processed();
                if let Some(out) = processor::apply(&session_id, state, event) {
                    self.broadcast(out);
                }
            }
            AdapterEvent::Closed(outcome) => {
                let messages = processor::finalize(&session_id, state, &outcome, now);
                self.record_outcome(&outcome);
                self.broadcast_all(messages);
            }
        }
    }

    fn heartbeat(&mut self) {
        let pruned = self
            .registry
            .heartbeat(Instant::now(), self.config.heartbeat_ack_timeout());
        if pruned > 0 {
            self.metrics.subscribers_pruned(pruned);
        }
    }

    fn shutdown(&mut self) {
        let live = self.store.streaming_ids();
        if !live.is_empty() {
            info!("aborting {} live stream(s) for shutdown", live.len());
        }
        for session_id in live {
            self.abort(&session_id);
        }
    }

    /// Snapshot of one session (created if unknown) plus the active ids.
    fn state_sync(&mut self, session_id: Option<&str>) -> ServerMessage {
        let state = session_id.map(|id| self.store.get(id, Instant::now()).snapshot());
        ServerMessage::StateSync {
            session_id: session_id.map(str::to_string),
            state,
            active_session_ids: self.store.streaming_ids(),
        }
    }

    fn record_outcome(&self, outcome: &StreamOutcome) {
        match outcome {
            StreamOutcome::Completed => self.metrics.stream_completed(),
            StreamOutcome::Aborted => self.metrics.stream_aborted(),
            StreamOutcome::Failed(_) => self.metrics.stream_failed(),
        }
    }

    fn broadcast(&mut self, message: ServerMessage) {
        let pruned = self.registry.broadcast(&message);
        if pruned > 0 {
            self.metrics.subscribers_pruned(pruned);
        }
    }

    fn broadcast_all(&mut self, messages: Vec<ServerMessage>) {
        for message in messages {
            self.broadcast(message);
        }
    }

    fn send_to(&mut self, subscriber: SubscriberId, message: ServerMessage) {
        if self.registry.send_to(subscriber, message) == Delivery::Pruned {
            self.metrics.subscribers_pruned(1);
        }
    }
}

/// First tick one period from now; missed ticks are skipped, not bunched.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
