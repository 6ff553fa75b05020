//! Typed upstream events.
//!
//! The upstream payloads are loosely typed JSON; each frame type maps to one
//! variant here so the event processor can match exhaustively.

use serde::Deserialize;
use serde_json::Value;

use crate::error::FrameError;

/// One interpreted upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A run of assistant output text.
    Chunk { content: String },
    /// A tool began executing.
    ToolStart { name: String, id: String },
    /// A tool finished; `id` is absent on older upstreams, match by name then.
    ToolEnd {
        name: String,
        id: Option<String>,
        input: Option<Value>,
    },
    /// A sub-agent was dispatched. There is no matching end event.
    AgentStart {
        agent_type: String,
        model: String,
        description: String,
    },
    /// Out-of-band UI directive ("navigate", "highlight", ...), forwarded verbatim.
    Action(Value),
    /// The upstream persisted the assistant message under this id.
    Done { message_id: String },
    /// Auto-generated session title.
    Title { title: String },
    /// The upstream reported an error mid-turn.
    Error { message: String },
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(alias = "text")]
    content: String,
}

#[derive(Deserialize)]
struct ToolStartPayload {
    name: String,
    id: String,
}

#[derive(Deserialize)]
struct ToolEndPayload {
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct AgentStartPayload {
    #[serde(rename = "type", alias = "agent_type")]
    agent_type: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct DonePayload {
    #[serde(alias = "messageId")]
    message_id: String,
}

#[derive(Deserialize)]
struct TitlePayload {
    title: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(alias = "error")]
    message: String,
}

impl UpstreamEvent {
    /// Interpret a frame's JSON payload according to its type line.
    pub fn parse(event_type: &str, data: &str) -> Result<Self, FrameError> {
        let event = match event_type {
            "chunk" => {
                let p: ChunkPayload = serde_json::from_str(data)?;
                Self::Chunk { content: p.content }
            }
            "tool_start" => {
                let p: ToolStartPayload = serde_json::from_str(data)?;
                Self::ToolStart {
                    name: p.name,
                    id: p.id,
                }
            }
            "tool_end" => {
                let p: ToolEndPayload = serde_json::from_str(data)?;
                Self::ToolEnd {
                    name: p.name,
                    id: p.id,
                    input: p.input,
                }
            }
            "agent_start" => {
                let p: AgentStartPayload = serde_json::from_str(data)?;
                Self::AgentStart {
                    agent_type: p.agent_type,
                    model: p.model,
                    description: p.description,
                }
            }
            "action" => Self::Action(serde_json::from_str(data)?),
            "done" => {
                let p: DonePayload = serde_json::from_str(data)?;
                Self::Done {
                    message_id: p.message_id,
                }
            }
            "title" => {
                let p: TitlePayload = serde_json::from_str(data)?;
                Self::Title { title: p.title }
            }
            "error" => {
                let p: ErrorPayload = serde_json::from_str(data)?;
                Self::Error { message: p.message }
            }
            other => return Err(FrameError::UnknownType(other.to_string())),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk() {
        let event = UpstreamEvent::parse("chunk", r#"{"content":"Hel"}"#).unwrap();
        assert_eq!(
            event,
            UpstreamEvent::Chunk {
                content: "Hel".to_string()
            }
        );
    }

    #[test]
    fn test_parse_tool_end_without_id() {
        let event = UpstreamEvent::parse(
            "tool_end",
            r#"{"name":"Bash","input":{"command":"ls"}}"#,
        )
        .unwrap();
        match event {
            UpstreamEvent::ToolEnd { name, id, input } => {
                assert_eq!(name, "Bash");
                assert!(id.is_none());
                assert_eq!(input.unwrap()["command"], "ls");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_agent_start_uses_type_field() {
        let event = UpstreamEvent::parse(
            "agent_start",
            r#"{"type":"Explore","model":"haiku","description":"scan repo"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            UpstreamEvent::AgentStart {
                agent_type: "Explore".to_string(),
                model: "haiku".to_string(),
                description: "scan repo".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_done_accepts_camel_case_id() {
        let event = UpstreamEvent::parse("done", r#"{"messageId":"m1"}"#).unwrap();
        assert_eq!(
            event,
            UpstreamEvent::Done {
                message_id: "m1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_action_is_verbatim() {
        let event =
            UpstreamEvent::parse("action", r#"{"type":"navigate","path":"/repos/1"}"#).unwrap();
        match event {
            UpstreamEvent::Action(value) => assert_eq!(value["path"], "/repos/1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let err = UpstreamEvent::parse("chunk", "{not json").unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        assert!(UpstreamEvent::parse("tool_start", r#"{"name":"Read"}"#).is_err());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let err = UpstreamEvent::parse("usage", "{}").unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(t) if t == "usage"));
    }
}
