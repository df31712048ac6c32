//! Provider trait: the abstraction over LLM backends.
//!
//! Each vendor speaks a different wire protocol (token deltas, content blocks,
//! buffered request/response). Adapters normalize all of them into one lazy
//! sequence of [`StreamChunk`]s so the conversation loop never needs to know
//! which vendor it is talking to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::{ChatMessage, MessageToolCall, Usage};

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name (unique within a registry)
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// One normalized event produced by a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A piece of assistant text.
    Text(String),
    /// A fully assembled tool call.
    ToolCall(MessageToolCall),
    /// Successful end of the response.
    Done(Option<Usage>),
    /// Failed end of the response.
    Error(String),
}

impl StreamChunk {
    /// `Done` and `Error` end a stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done(_) | StreamChunk::Error(_))
    }
}

/// The core Provider trait.
///
/// Contract for implementors:
/// - chunks arrive in emission order
/// - exactly one terminal chunk (`Done` or `Error`) is sent, and it is the last
/// - failures never escape as panics or errors; they become an `Error` chunk
#[async_trait]
pub trait Provider: Send + Sync {
    /// A short name for this provider (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// The model requests are sent to.
    fn model(&self) -> &str;

    /// Send the transcript and receive the response as a chunk stream.
    async fn chat(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        system_prompt: &str,
    ) -> mpsc::Receiver<StreamChunk>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_chunks() {
        assert!(StreamChunk::Done(None).is_terminal());
        assert!(StreamChunk::Error("boom".into()).is_terminal());
        assert!(!StreamChunk::Text("hi".into()).is_terminal());
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "run_shell".into(),
            description: "Execute a shell command".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command to run" }
                },
                "required": ["command"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("run_shell"));
        assert!(json.contains("command"));
    }
}
