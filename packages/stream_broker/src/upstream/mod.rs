//! Upstream Stream Adapter
//!
//! Opens one abortable event stream per active session, decodes it into
//! frames, interprets each frame as an [`UpstreamEvent`] and forwards it to
//! the broker task tagged with the session id and the stream generation.
//!
//! Every termination path (natural end, cancellation, bad status, transport
//! failure) ends in exactly one [`AdapterEvent::Closed`] message, which the
//! broker turns into the single finalization step for the turn.

mod events;
mod framing;
mod http;

pub use events::UpstreamEvent;
pub use framing::{DEFAULT_FRAME_TYPE, Frame, FrameDecoder};
pub use http::HttpUpstream;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;
use crate::metrics::BrokerMetrics;

/// Raw body chunks as they come off the transport.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, UpstreamError>>;

/// What the upstream endpoint receives when a turn starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartRequest {
    pub session_id: String,
    pub content: String,
    #[serde(rename = "model", skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

/// Opens the streamed response for one turn.
///
/// The production implementation is [`HttpUpstream`]; tests plug in scripted
/// byte streams.
pub trait UpstreamConnector: Send + Sync + 'static {
    fn open(&self, request: StartRequest) -> BoxFuture<'static, Result<ByteStream, UpstreamError>>;
}

/// How a stream ended. Carried into the `STREAM_END` broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Transport reached end-of-stream.
    Completed,
    /// Cancelled by `STOP`, a restart, `CLEAR_STATE` or shutdown.
    Aborted,
    /// Bad status, connect failure or broken transport.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Frame(UpstreamEvent),
    Closed(StreamOutcome),
}

/// Adapter output as seen by the broker task.
#[derive(Debug, Clone)]
pub struct AdapterMessage {
    pub session_id: String,
    pub generation: u64,
    pub event: AdapterEvent,
}

/// Spawn the read loop for one turn. Cancel `cancel` to abort it.
pub fn spawn_adapter(
    connector: Arc<dyn UpstreamConnector>,
    request: StartRequest,
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::Sender<AdapterMessage>,
    metrics: Arc<BrokerMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_adapter(
        connector, request, generation, cancel, events, metrics,
    ))
}

async fn run_adapter(
    connector: Arc<dyn UpstreamConnector>,
    request: StartRequest,
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::Sender<AdapterMessage>,
    metrics: Arc<BrokerMetrics>,
) {
    let session_id = request.session_id.clone();
    debug!(%session_id, generation, "upstream adapter starting");

    let outcome = tokio::select! {
        _ = cancel.cancelled() => StreamOutcome::Aborted,
        outcome = pump(connector.as_ref(), request, generation, &events, &metrics) => outcome,
    };

    match &outcome {
        StreamOutcome::Failed(reason) => {
            warn!(%session_id, generation, "upstream stream failed: {}", reason)
        }
        other => info!(%session_id, generation, "upstream stream ended: {:?}", other),
    }

    // The broker may already have moved on (stale generation) or shut down.
    let _ = events
        .send(AdapterMessage {
            session_id,
            generation,
            event: AdapterEvent::Closed(outcome),
        })
        .await;
}

async fn pump(
    connector: &dyn UpstreamConnector,
    request: StartRequest,
    generation: u64,
    events: &mpsc::Sender<AdapterMessage>,
    metrics: &BrokerMetrics,
) -> StreamOutcome {
    let session_id = request.session_id.clone();
    let mut stream = match connector.open(request).await {
        Ok(stream) => stream,
        Err(e) => return StreamOutcome::Failed(e.to_string()),
    };

    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        };
        for frame in decoder.feed(&bytes) {
            if !forward(&session_id, generation, frame, events, metrics).await {
                return StreamOutcome::Aborted;
            }
        }
    }

    if let Some(frame) = decoder.finish() {
        if !forward(&session_id, generation, frame, events, metrics).await {
            return StreamOutcome::Aborted;
        }
    }

    StreamOutcome::Completed
}

/// Returns false once the broker is gone.
async fn forward(
    session_id: &str,
    generation: u64,
    frame: Frame,
    events: &mpsc::Sender<AdapterMessage>,
    metrics: &BrokerMetrics,
) -> bool {
    let event = match UpstreamEvent::parse(&frame.event_type, &frame.data) {
        Ok(event) => event,
        Err(e) => {
            metrics.frame_skipped();
            debug!(%session_id, "skipping {} frame: {}", frame.event_type, e);
            return true;
        }
    };

    events
        .send(AdapterMessage {
            session_id: session_id.to_string(),
            generation,
            event: AdapterEvent::Frame(event),
        })
        .await
        .is_ok()
}
