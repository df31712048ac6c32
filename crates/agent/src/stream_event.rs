//! Agent-level streaming events.
//!
//! `AgentStreamEvent` is what callers of the conversation loop see. The
//! gateway forwards these over SSE or WebSocket; workers fold them into a
//! single reply.

use relayclaw_core::message::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted by the conversation loop.
///
/// Wire shape (`type` tag, camelCase fields):
/// - `text`: partial text from the model
/// - `tool_start`: a tool is about to run
/// - `tool_result`: the tool finished
/// - `done`: always last, exactly once
/// - `error`: provider or storage failure; `done` still follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentStreamEvent {
    Text {
        content: String,
    },

    ToolStart {
        tool_name: String,
        tool_args: serde_json::Value,
    },

    ToolResult {
        tool_name: String,
        tool_result: String,
    },

    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    Error {
        error: String,
    },
}

impl AgentStreamEvent {
    /// Event name for SSE / WebSocket framing.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_wire_shape() {
        let event = AgentStreamEvent::Text {
            content: "Hello".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "content": "Hello"}));
    }

    #[test]
    fn tool_events_use_camel_case() {
        let start = AgentStreamEvent::ToolStart {
            tool_name: "run_shell".into(),
            tool_args: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["toolName"], "run_shell");
        assert_eq!(json["toolArgs"]["command"], "ls");

        let result = AgentStreamEvent::ToolResult {
            tool_name: "run_shell".into(),
            tool_result: "{}".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["toolResult"], "{}");
    }

    #[test]
    fn done_omits_missing_usage() {
        let json = serde_json::to_string(&AgentStreamEvent::Done { usage: None }).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);

        let done = AgentStreamEvent::Done {
            usage: Some(Usage::new(10, 20)),
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["usage"]["promptTokens"], 10);
        assert_eq!(json["usage"]["totalTokens"], 30);
    }

    #[test]
    fn event_type_names() {
        assert_eq!(AgentStreamEvent::Text { content: "x".into() }.event_type(), "text");
        assert_eq!(AgentStreamEvent::Error { error: "x".into() }.event_type(), "error");
        assert!(AgentStreamEvent::Done { usage: None }.is_done());
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"error","error":"boom"}"#;
        let event: AgentStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, AgentStreamEvent::Error { error: "boom".into() });
    }
}
