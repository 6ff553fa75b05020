//! WebSocket message protocol
//!
//! JSON text frames tagged by `"type"`. Every session-scoped message carries
//! its `session_id` so a single socket can follow any number of sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::SessionSnapshot;

/// Messages sent FROM a tab TO the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Begin a turn. Restarts the session's stream if one is live.
    Start {
        session_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_override: Option<String>,
    },
    /// Abort the session's live stream, if any.
    Stop { session_id: String },
    /// Ask for a snapshot. Without a session id only the active ids come back.
    GetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Drop all state for a session, aborting any live stream.
    ClearState { session_id: String },
    HeartbeatAck,
}

/// Messages sent FROM the broker TO every tab (or to one, for sync/rejection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    // === Turn lifecycle ===
    StreamStart {
        session_id: String,
    },
    /// A text delta plus the full buffer so far, so a tab can resync from either.
    Chunk {
        session_id: String,
        delta: String,
        full_buffer: String,
    },
    ToolStart {
        session_id: String,
        name: String,
        id: String,
    },
    ToolEnd {
        session_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    AgentStart {
        session_id: String,
        agent_type: String,
        model: String,
        description: String,
    },
    /// UI directive from the upstream, untouched.
    Action {
        session_id: String,
        action: Value,
    },
    TitleUpdate {
        session_id: String,
        title: String,
    },
    Error {
        session_id: String,
        message: String,
    },
    /// Always immediately followed by `StreamEnd` for the same session.
    Done {
        session_id: String,
        message_id: String,
        content: String,
    },
    /// The single authoritative "turn is over" signal.
    StreamEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        final_content: String,
        success: bool,
        aborted: bool,
    },

    // === Requester-only ===
    /// A `Start` was refused; no session state was touched.
    StartRejected {
        session_id: String,
        reason: String,
        active: usize,
        max: usize,
    },

    // === Sync ===
    StateSync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// `None` for a cleared or never-seen session.
        state: Option<SessionSnapshot>,
        active_session_ids: Vec<String>,
    },
    HeartbeatPing,
}
