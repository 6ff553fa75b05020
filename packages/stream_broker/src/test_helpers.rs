//! Shared helpers for unit tests: a scripted upstream whose byte streams the
//! test feeds by hand.

use futures::FutureExt;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::UpstreamError;
use crate::upstream::{ByteStream, StartRequest, UpstreamConnector};

/// Connector that hands out pre-registered streams, one per `open`, keyed by
/// session id. Opening a session with nothing scripted fails with `Connect`.
#[derive(Clone, Default)]
pub(crate) struct ScriptedUpstream {
    scripts: Arc<Mutex<HashMap<String, VecDeque<ByteStream>>>>,
    requests: Arc<Mutex<Vec<StartRequest>>>,
    opened: Arc<AtomicUsize>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next `open` of `session_id`.
    pub fn script(&self, session_id: &str) -> ScriptFeed {
        let (tx, rx) = unbounded();
        self.scripts
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push_back(rx.boxed());
        ScriptFeed { tx }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StartRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl UpstreamConnector for ScriptedUpstream {
    fn open(&self, request: StartRequest) -> BoxFuture<'static, Result<ByteStream, UpstreamError>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let stream = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.session_id)
            .and_then(|queue| queue.pop_front());
        self.requests.lock().unwrap().push(request);
        async move { stream.ok_or_else(|| UpstreamError::Connect("connection refused".to_string())) }
            .boxed()
    }
}

/// Test-side end of a scripted stream.
pub(crate) struct ScriptFeed {
    tx: UnboundedSender<Result<Vec<u8>, UpstreamError>>,
}

impl ScriptFeed {
    pub fn send_str(&self, text: &str) {
        let _ = self.tx.unbounded_send(Ok(text.as_bytes().to_vec()));
    }

    pub fn fail(&self, err: UpstreamError) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    /// End the stream naturally.
    pub fn close(&self) {
        self.tx.close_channel();
    }

    /// True once the adapter has dropped its end.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}
