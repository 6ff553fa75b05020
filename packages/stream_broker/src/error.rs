//! Error types shared by the broker, its upstream adapter, and the frame parser.

use thiserror::Error;

/// Failures opening or reading an upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The endpoint answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never reached the endpoint (refused, DNS, timeout).
    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    /// The connection broke while the body was being streamed.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            UpstreamError::Connect(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

/// A single data line that could not be turned into an [`UpstreamEvent`].
///
/// Never fatal: the adapter logs it and moves on to the next line.
///
/// [`UpstreamEvent`]: crate::upstream::UpstreamEvent
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Why a `START` request was refused. Refusals never touch session state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("concurrent stream limit reached ({active}/{max})")]
    ConcurrencyLimit { active: usize, max: usize },
}

/// Errors surfaced by [`BrokerHandle`](crate::broker::BrokerHandle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker task has shut down (or never started).
    #[error("broker is not running")]
    Unavailable,

    #[error("start rejected: {0}")]
    Rejected(#[from] StartRejection),
}
