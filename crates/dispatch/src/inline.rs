//! Inline dispatch: run the conversation on the caller's request.
//!
//! Streaming callers (SSE, WebSocket) consume the receiver from
//! [`ConversationLoop::run_conversation`] directly. JSON callers use
//! [`run_inline`], which folds the stream into one [`InlineReply`].

use relayclaw_agent::{AgentStreamEvent, ConversationLoop};
use relayclaw_core::message::Usage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One tool invocation as seen by an inline caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// The collected result of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineReply {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InlineReply {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Fold one event in. Returns true once `done` has been seen.
    pub fn absorb(&mut self, event: AgentStreamEvent) -> bool {
        match event {
            AgentStreamEvent::Text { content } => self.text.push_str(&content),
            AgentStreamEvent::ToolStart { tool_name, tool_args } => {
                self.tool_calls.push(ToolCallRecord {
                    name: tool_name,
                    args: tool_args,
                    result: None,
                });
            }
            AgentStreamEvent::ToolResult { tool_name, tool_result } => {
                // Tools in a round run sequentially, so the result belongs to
                // the latest pending call with that name.
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .rev()
                    .find(|c| c.name == tool_name && c.result.is_none())
                {
                    call.result = Some(tool_result);
                }
            }
            AgentStreamEvent::Error { error } => {
                self.error = Some(match self.error.take() {
                    Some(prev) => format!("{prev}; {error}"),
                    None => error,
                });
            }
            AgentStreamEvent::Done { usage } => {
                self.usage = usage;
                return true;
            }
        }
        false
    }
}

/// Drain an event stream into an [`InlineReply`].
///
/// A stream that closes without `done` is reported as an error.
pub async fn collect(mut events: mpsc::Receiver<AgentStreamEvent>) -> InlineReply {
    let mut reply = InlineReply::default();
    while let Some(event) = events.recv().await {
        if reply.absorb(event) {
            return reply;
        }
    }
    if reply.error.is_none() {
        reply.error = Some("conversation ended unexpectedly".into());
    }
    reply
}

/// Run one message through the loop and wait for the whole answer.
pub async fn run_inline(
    conversation: &ConversationLoop,
    channel: &str,
    peer_id: &str,
    text: &str,
) -> InlineReply {
    collect(conversation.run_conversation(channel, peer_id, text)).await
}
