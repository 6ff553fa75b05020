//! Session State Store
//!
//! In-memory map of session id to per-session turn state. Nothing here is
//! persisted; a restart starts from an empty store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A typed piece of the current turn's output, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Text {
        content: String,
    },
    ToolCall {
        name: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    /// Complete on creation: the upstream never reports an agent ending.
    AgentLaunch {
        #[serde(rename = "type")]
        agent_type: String,
        model: String,
        description: String,
        launched_at: DateTime<Utc>,
    },
}

impl Segment {
    pub fn empty_text() -> Self {
        Segment::Text {
            content: String::new(),
        }
    }
}

/// A tool that has started and not yet ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolHandle {
    pub name: String,
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Where a session is in its turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Adapter attached, no frame seen yet.
    Connecting,
    Streaming,
}

/// The live upstream for a session: its generation and cancel handle.
#[derive(Debug, Clone)]
pub struct UpstreamAttachment {
    pub generation: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct SessionState {
    pub phase: TurnPhase,
    /// Every text delta of the current turn, concatenated.
    pub buffer: String,
    /// Always ends with a `Text` segment (the write target for chunks).
    pub segments: Vec<Segment>,
    pub active_tools: Vec<ToolHandle>,
    pub last_message_id: Option<String>,
    pub title: Option<String>,
    pub last_activity: Instant,
    pub had_error: bool,
    /// Present exactly while `phase != Idle`.
    pub upstream: Option<UpstreamAttachment>,
}

impl SessionState {
    pub fn new(now: Instant) -> Self {
        Self {
            phase: TurnPhase::Idle,
            buffer: String::new(),
            segments: vec![Segment::empty_text()],
            active_tools: Vec::new(),
            last_message_id: None,
            title: None,
            last_activity: now,
            had_error: false,
            upstream: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    /// Clear everything scoped to a single turn. The title survives.
    pub fn reset_turn(&mut self) {
        self.buffer.clear();
        self.segments = vec![Segment::empty_text()];
        self.active_tools.clear();
        self.last_message_id = None;
        self.had_error = false;
    }

    /// Extend the trailing text segment.
    pub fn append_text(&mut self, delta: &str) {
        match self.segments.last_mut() {
            Some(Segment::Text { content }) => content.push_str(delta),
            _ => self.segments.push(Segment::Text {
                content: delta.to_string(),
            }),
        }
    }

    /// Append a tool or agent segment followed by a fresh text write target.
    pub fn push_activity(&mut self, segment: Segment) {
        self.segments.push(segment);
        self.segments.push(Segment::empty_text());
    }

    /// Concatenation of the text segments; equals `buffer` at all times.
    pub fn rendered_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            buffer: self.buffer.clone(),
            segments: self.segments.clone(),
            active_tools: self.active_tools.clone(),
            streaming: self.is_streaming(),
            title: self.title.clone(),
        }
    }
}

/// What a late-joining tab needs to render a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub buffer: String,
    pub segments: Vec<Segment>,
    pub active_tools: Vec<ToolHandle>,
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// All tracked sessions. Every method is synchronous and non-blocking.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing state, or a fresh default. Stamps `last_activity` either way.
    pub fn get(&mut self, session_id: &str, now: Instant) -> &mut SessionState {
        let state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(now));
        state.last_activity = now;
        state
    }

    /// Look without creating or stamping.
    pub fn peek(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    pub fn peek_mut(&mut self, session_id: &str) -> Option<&mut SessionState> {
        self.sessions.get_mut(session_id)
    }

    /// Refresh `last_activity` only. Returns false for unknown sessions.
    pub fn touch(&mut self, session_id: &str, now: Instant) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(state) => {
                state.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Remove unconditionally. Callers decide whether that is allowed.
    pub fn evict(&mut self, session_id: &str) -> Option<SessionState> {
        self.sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SessionState)> {
        self.sessions.iter()
    }

    pub fn streaming_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_streaming()).count()
    }

    /// Ids of sessions with an attached upstream, sorted for stable output.
    pub fn streaming_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, state)| state.is_streaming())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
