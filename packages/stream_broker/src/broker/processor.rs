//! Event Processor
//!
//! Pure state transitions for one session's turn. Each function mutates the
//! session synchronously and returns what should be broadcast; the broker
//! does the sending, so no partial mutation ever straddles an await.
//!
//! ```text
//! Idle --begin_turn--> Connecting --first frame--> Streaming
//!   ^                                                 |
//!   +------------- finalize (completed/aborted/failed) +
//! ```

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use super::state::{Segment, SessionState, ToolHandle, TurnPhase, UpstreamAttachment};
use crate::upstream::{StreamOutcome, UpstreamEvent};
use crate::ws::ServerMessage;

/// Reset the turn, attach the new upstream and announce the stream.
///
/// The caller must already have finalized any previous attachment.
pub fn begin_turn(
    session_id: &str,
    state: &mut SessionState,
    attachment: UpstreamAttachment,
) -> ServerMessage {
    state.reset_turn();
    state.phase = TurnPhase::Connecting;
    state.upstream = Some(attachment);
    ServerMessage::StreamStart {
        session_id: session_id.to_string(),
    }
}

/// Apply one upstream event. Returns the broadcast it produces, if any.
pub fn apply(
    session_id: &str,
    state: &mut SessionState,
    event: UpstreamEvent,
) -> Option<ServerMessage> {
    if state.phase == TurnPhase::Connecting {
        state.phase = TurnPhase::Streaming;
    }

    let session_id = session_id.to_string();
    match event {
        UpstreamEvent::Chunk { content } => {
            state.buffer.push_str(&content);
            state.append_text(&content);
            Some(ServerMessage::Chunk {
                session_id,
                delta: content,
                full_buffer: state.buffer.clone(),
            })
        }
        UpstreamEvent::ToolStart { name, id } => {
            state.active_tools.push(ToolHandle {
                name: name.clone(),
                id: id.clone(),
                started_at: Utc::now(),
            });
            Some(ServerMessage::ToolStart {
                session_id,
                name,
                id,
            })
        }
        UpstreamEvent::ToolEnd { name, id, input } => {
            let matched = take_active_tool(&mut state.active_tools, &name, id.as_deref());
            if matched.is_none() {
                debug!(%session_id, "tool_end for {} without a matching tool_start", name);
            }
            let segment_id = id
                .clone()
                .or_else(|| matched.map(|tool| tool.id))
                .unwrap_or_default();
            state.push_activity(Segment::ToolCall {
                name: name.clone(),
                id: segment_id,
                input: input.clone(),
                completed_at: Some(Utc::now()),
            });
            Some(ServerMessage::ToolEnd {
                session_id,
                name,
                id,
                input,
            })
        }
        UpstreamEvent::AgentStart {
            agent_type,
            model,
            description,
        } => {
            state.push_activity(Segment::AgentLaunch {
                agent_type: agent_type.clone(),
                model: model.clone(),
                description: description.clone(),
                launched_at: Utc::now(),
            });
            Some(ServerMessage::AgentStart {
                session_id,
                agent_type,
                model,
                description,
            })
        }
        UpstreamEvent::Action(action) => Some(ServerMessage::Action { session_id, action }),
        UpstreamEvent::Done { message_id } => {
            // Held until finalize so DONE and STREAM_END go out back to back.
            state.last_message_id = Some(message_id);
            None
        }
        UpstreamEvent::Title { title } => {
            state.title = Some(title.clone());
            Some(ServerMessage::TitleUpdate { session_id, title })
        }
        UpstreamEvent::Error { message } => {
            state.had_error = true;
            Some(ServerMessage::Error {
                session_id,
                message,
            })
        }
    }
}

/// Match by id when the upstream supplies one, otherwise the oldest tool of that name.
fn take_active_tool(
    active: &mut Vec<ToolHandle>,
    name: &str,
    id: Option<&str>,
) -> Option<ToolHandle> {
    let position = id
        .and_then(|id| active.iter().position(|tool| tool.id == id))
        .or_else(|| active.iter().position(|tool| tool.name == name))?;
    Some(active.remove(position))
}

/// The one terminal step for a turn, whatever ended it.
///
/// Emits `ERROR` (failures only), `DONE` (if a message id was recorded) and
/// `STREAM_END`, then returns the session to `Idle`. Cancels the attachment
/// so an adapter that is still running stops reading. A no-op when idle.
pub fn finalize(
    session_id: &str,
    state: &mut SessionState,
    outcome: &StreamOutcome,
    now: Instant,
) -> Vec<ServerMessage> {
    let Some(attachment) = state.upstream.take() else {
        return Vec::new();
    };
    attachment.cancel.cancel();

    let mut messages = Vec::with_capacity(3);
    if let StreamOutcome::Failed(message) = outcome {
        state.had_error = true;
        messages.push(ServerMessage::Error {
            session_id: session_id.to_string(),
            message: message.clone(),
        });
    }

    let message_id = state.last_message_id.take();
    if let Some(id) = &message_id {
        messages.push(ServerMessage::Done {
            session_id: session_id.to_string(),
            message_id: id.clone(),
            content: state.buffer.clone(),
        });
    }

    messages.push(ServerMessage::StreamEnd {
        session_id: session_id.to_string(),
        message_id,
        final_content: std::mem::take(&mut state.buffer),
        success: !state.had_error,
        aborted: *outcome == StreamOutcome::Aborted,
    });

    state.reset_turn();
    state.phase = TurnPhase::Idle;
    state.last_activity = now;
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn attach(state: &mut SessionState) -> CancellationToken {
        let cancel = CancellationToken::new();
        begin_turn(
            "s1",
            state,
            UpstreamAttachment {
                generation: 1,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    fn chunk(content: &str) -> UpstreamEvent {
        UpstreamEvent::Chunk {
            content: content.to_string(),
        }
    }

    #[test]
    fn test_hello_scenario_broadcast_sequence() {
        let mut state = SessionState::new(Instant::now());
        let cancel = CancellationToken::new();
        let mut out = vec![begin_turn(
            "S1",
            &mut state,
            UpstreamAttachment {
                generation: 1,
                cancel: cancel.clone(),
            },
        )];
        assert_eq!(state.phase, TurnPhase::Connecting);

        out.extend(apply("S1", &mut state, chunk("Hel")));
        assert_eq!(state.phase, TurnPhase::Streaming);
        out.extend(apply("S1", &mut state, chunk("lo")));
        out.extend(apply(
            "S1",
            &mut state,
            UpstreamEvent::Done {
                message_id: "m1".to_string(),
            },
        ));
        out.extend(finalize(
            "S1",
            &mut state,
            &StreamOutcome::Completed,
            Instant::now(),
        ));

        let s = |v: &str| v.to_string();
        assert_eq!(
            out,
            vec![
                ServerMessage::StreamStart { session_id: s("S1") },
                ServerMessage::Chunk {
                    session_id: s("S1"),
                    delta: s("Hel"),
                    full_buffer: s("Hel"),
                },
                ServerMessage::Chunk {
                    session_id: s("S1"),
                    delta: s("lo"),
                    full_buffer: s("Hello"),
                },
                ServerMessage::Done {
                    session_id: s("S1"),
                    message_id: s("m1"),
                    content: s("Hello"),
                },
                ServerMessage::StreamEnd {
                    session_id: s("S1"),
                    message_id: Some(s("m1")),
                    final_content: s("Hello"),
                    success: true,
                    aborted: false,
                },
            ]
        );
        assert_eq!(state.phase, TurnPhase::Idle);
        assert!(state.upstream.is_none());
        assert!(state.buffer.is_empty());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_text_reconstruction_across_tools_and_agents() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);

        let events = vec![
            chunk("Let me look. "),
            UpstreamEvent::ToolStart {
                name: "Read".to_string(),
                id: "t1".to_string(),
            },
            UpstreamEvent::ToolEnd {
                name: "Read".to_string(),
                id: Some("t1".to_string()),
                input: Some(json!({"path": "src/lib.rs"})),
            },
            chunk("Found it. "),
            UpstreamEvent::AgentStart {
                agent_type: "Explore".to_string(),
                model: "haiku".to_string(),
                description: "scan".to_string(),
            },
            UpstreamEvent::Action(json!({"type": "navigate"})),
            chunk("Done."),
        ];
        for event in events {
            apply("s1", &mut state, event);
            assert_eq!(state.rendered_text(), state.buffer);
            assert!(matches!(state.segments.last(), Some(Segment::Text { .. })));
        }

        assert_eq!(state.buffer, "Let me look. Found it. Done.");
        assert!(state.active_tools.is_empty());
        assert!(matches!(
            &state.segments[1],
            Segment::ToolCall { id, completed_at: Some(_), input: Some(_), .. } if id == "t1"
        ));
        assert!(matches!(&state.segments[3], Segment::AgentLaunch { .. }));
    }

    #[test]
    fn test_tool_end_matches_by_id_then_name() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        for (name, id) in [("Bash", "a"), ("Bash", "b"), ("Grep", "c")] {
            apply(
                "s1",
                &mut state,
                UpstreamEvent::ToolStart {
                    name: name.to_string(),
                    id: id.to_string(),
                },
            );
        }

        apply(
            "s1",
            &mut state,
            UpstreamEvent::ToolEnd {
                name: "Bash".to_string(),
                id: Some("b".to_string()),
                input: None,
            },
        );
        let ids: Vec<&str> = state.active_tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        apply(
            "s1",
            &mut state,
            UpstreamEvent::ToolEnd {
                name: "Grep".to_string(),
                id: None,
                input: None,
            },
        );
        let ids: Vec<&str> = state.active_tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        // Id recovered from the matched handle.
        assert!(state
            .segments
            .iter()
            .any(|s| matches!(s, Segment::ToolCall { name, id, .. } if name == "Grep" && id == "c")));
    }

    #[test]
    fn test_done_is_deferred() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        let out = apply(
            "s1",
            &mut state,
            UpstreamEvent::Done {
                message_id: "m".to_string(),
            },
        );
        assert!(out.is_none());
        assert_eq!(state.last_message_id.as_deref(), Some("m"));
    }

    #[test]
    fn test_error_frame_marks_turn_unsuccessful() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        apply("s1", &mut state, chunk("partial"));
        apply(
            "s1",
            &mut state,
            UpstreamEvent::Error {
                message: "rate limited".to_string(),
            },
        );

        let out = finalize("s1", &mut state, &StreamOutcome::Completed, Instant::now());
        assert_eq!(
            out,
            vec![ServerMessage::StreamEnd {
                session_id: "s1".to_string(),
                message_id: None,
                final_content: "partial".to_string(),
                success: false,
                aborted: false,
            }]
        );
        assert!(!state.had_error);
    }

    #[test]
    fn test_failed_outcome_emits_error_then_end() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);

        let out = finalize(
            "s1",
            &mut state,
            &StreamOutcome::Failed("upstream returned HTTP 502: bad gateway".to_string()),
            Instant::now(),
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], ServerMessage::Error { message, .. } if message.contains("502")));
        assert!(matches!(
            &out[1],
            ServerMessage::StreamEnd { success: false, aborted: false, .. }
        ));
    }

    #[test]
    fn test_aborted_keeps_partial_buffer_in_stream_end() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        apply("s1", &mut state, chunk("half an ans"));

        let out = finalize("s1", &mut state, &StreamOutcome::Aborted, Instant::now());
        assert_eq!(
            out,
            vec![ServerMessage::StreamEnd {
                session_id: "s1".to_string(),
                message_id: None,
                final_content: "half an ans".to_string(),
                success: true,
                aborted: true,
            }]
        );
        assert_eq!(state.phase, TurnPhase::Idle);
    }

    #[test]
    fn test_finalize_twice_emits_once() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        assert_eq!(
            finalize("s1", &mut state, &StreamOutcome::Completed, Instant::now()).len(),
            1
        );
        assert!(finalize("s1", &mut state, &StreamOutcome::Aborted, Instant::now()).is_empty());
    }

    #[test]
    fn test_title_survives_finalize() {
        let mut state = SessionState::new(Instant::now());
        attach(&mut state);
        apply(
            "s1",
            &mut state,
            UpstreamEvent::Title {
                title: "Fix login".to_string(),
            },
        );
        finalize("s1", &mut state, &StreamOutcome::Completed, Instant::now());
        assert_eq!(state.title.as_deref(), Some("Fix login"));
    }
}
