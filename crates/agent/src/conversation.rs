//! The bounded-round conversation loop.
//!
//! For one inbound message:
//!
//! 1. Append the user message to the session
//! 2. Send the transcript to the provider and stream its chunks
//! 3. Persist one assistant message for the round
//! 4. If the model asked for tools: run them in order, persist each result,
//!    and go back to 2
//! 5. Otherwise finish
//!
//! The round ceiling is the only liveness bound. Every run ends with exactly
//! one `done` event, including runs that fail.

use std::sync::Arc;

use relayclaw_config::AgentConfig;
use relayclaw_core::error::SessionError;
use relayclaw_core::message::{ChatMessage, MessageToolCall, Usage};
use relayclaw_core::provider::{Provider, StreamChunk};
use relayclaw_core::session::SessionStore;
use relayclaw_core::tool::{Tool, ToolRegistry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reflection::{PostProcessor, spawn_detached};
use crate::stream_event::AgentStreamEvent;

const EVENT_BUFFER: usize = 128;
const DEFAULT_MAX_ROUNDS: usize = 10;

/// How a run ended, before the closing `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The model answered without asking for tools.
    Finished,
    /// The round ceiling was hit while the model still wanted tools.
    RoundLimit,
    /// The provider reported an error; it has been forwarded.
    ProviderFailed,
    /// The caller dropped the event receiver.
    Abandoned,
}

/// Drives provider rounds and tool execution for one session at a time.
///
/// Cheap to clone; every run gets its own task.
#[derive(Clone)]
pub struct ConversationLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<dyn SessionStore>,
    system_prompt: String,
    max_rounds: usize,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl ConversationLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            provider,
            tools,
            sessions,
            system_prompt: String::new(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            post_processor: None,
        }
    }

    /// Apply the `[agent]` config section. Reflection is attached when enabled.
    pub fn with_config(self, config: &AgentConfig) -> Self {
        let this = self
            .with_system_prompt(config.system_prompt.clone())
            .with_max_rounds(config.max_tool_rounds);
        if config.reflection {
            this.with_post_processor(Arc::new(crate::reflection::Reflection))
        } else {
            this
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the round ceiling. Zero is treated as one.
    pub fn with_max_rounds(mut self, max: usize) -> Self {
        self.max_rounds = max.max(1);
        self
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Add (or replace) a tool available to subsequent rounds.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    /// Run one inbound message through the loop.
    ///
    /// Events arrive on the returned receiver; the last one is always `done`.
    pub fn run_conversation(
        &self,
        channel: &str,
        peer_id: &str,
        text: &str,
    ) -> mpsc::Receiver<AgentStreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let channel = channel.to_string();
        let peer_id = peer_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            this.drive(&channel, &peer_id, text, tx).await;
        });
        rx
    }

    async fn drive(&self, channel: &str, peer_id: &str, text: String, tx: mpsc::Sender<AgentStreamEvent>) {
        let mut usage: Option<Usage> = None;

        let result = self.run_rounds(channel, peer_id, text, &tx, &mut usage).await;
        let session_id = match result {
            Ok((id, Outcome::Finished | Outcome::RoundLimit)) => Some(id),
            Ok((_, Outcome::ProviderFailed | Outcome::Abandoned)) => None,
            Err(e) => {
                warn!(channel = %channel, peer = %peer_id, error = %e, "Session store failure");
                let _ = tx
                    .send(AgentStreamEvent::Error {
                        error: e.to_string(),
                    })
                    .await;
                None
            }
        };

        let _ = tx.send(AgentStreamEvent::Done { usage }).await;

        if let (Some(processor), Some(id)) = (&self.post_processor, session_id) {
            match self.sessions.get(&id).await {
                Ok(Some(session)) => spawn_detached(processor.clone(), session),
                Ok(None) => {}
                Err(e) => warn!(session = %id, error = %e, "Could not load session for post-processing"),
            }
        }
    }

    async fn run_rounds(
        &self,
        channel: &str,
        peer_id: &str,
        text: String,
        tx: &mpsc::Sender<AgentStreamEvent>,
        usage: &mut Option<Usage>,
    ) -> Result<(String, Outcome), SessionError> {
        let session = self.sessions.get_or_create(channel, peer_id).await?;
        let session_id = session.id;
        self.sessions.append(&session_id, ChatMessage::user(text)).await?;

        let definitions = self.tools.definitions();
        let mut round = 0;

        while round < self.max_rounds {
            round += 1;
            if tx.is_closed() {
                debug!(session = %session_id, "Event receiver dropped, stopping");
                return Ok((session_id, Outcome::Abandoned));
            }

            let history = self.sessions.messages(&session_id).await?;
            debug!(
                session = %session_id,
                round,
                history = history.len(),
                provider = %self.provider.name(),
                "Starting round"
            );
            let mut chunks = self
                .provider
                .chat(&history, &definitions, &self.system_prompt)
                .await;

            let mut round_text = String::new();
            let mut calls: Vec<MessageToolCall> = Vec::new();
            let mut terminated = false;

            while let Some(chunk) = chunks.recv().await {
                match chunk {
                    StreamChunk::Text(content) => {
                        round_text.push_str(&content);
                        let _ = tx.send(AgentStreamEvent::Text { content }).await;
                    }
                    StreamChunk::ToolCall(call) => calls.push(call),
                    StreamChunk::Done(round_usage) => {
                        if let Some(u) = round_usage {
                            debug!(round, prompt = u.prompt_tokens, completion = u.completion_tokens, "Usage");
                            *usage.get_or_insert_with(Usage::default) += u;
                        }
                        terminated = true;
                        break;
                    }
                    StreamChunk::Error(error) => {
                        warn!(session = %session_id, round, error = %error, "Provider error");
                        let _ = tx.send(AgentStreamEvent::Error { error }).await;
                        return Ok((session_id, Outcome::ProviderFailed));
                    }
                }
            }

            if !terminated {
                let error = format!("Provider '{}' stream ended without completing", self.provider.name());
                warn!(session = %session_id, round, "{error}");
                let _ = tx.send(AgentStreamEvent::Error { error }).await;
                return Ok((session_id, Outcome::ProviderFailed));
            }

            if !round_text.is_empty() || !calls.is_empty() {
                let message = if calls.is_empty() {
                    ChatMessage::assistant(round_text)
                } else {
                    ChatMessage::assistant_with_tools(round_text, calls.clone())
                };
                self.sessions.append(&session_id, message).await?;
            }

            if calls.is_empty() {
                return Ok((session_id, Outcome::Finished));
            }

            for call in calls {
                let args = parse_arguments(&call.name, &call.arguments);

                let _ = tx
                    .send(AgentStreamEvent::ToolStart {
                        tool_name: call.name.clone(),
                        tool_args: args.clone(),
                    })
                    .await;

                let result = self.tools.execute(&call.name, args).await;

                let _ = tx
                    .send(AgentStreamEvent::ToolResult {
                        tool_name: call.name.clone(),
                        tool_result: result.clone(),
                    })
                    .await;

                self.sessions
                    .append(&session_id, ChatMessage::tool_result(call.id, result))
                    .await?;
            }
        }

        warn!(channel = %channel, peer = %peer_id, rounds = round, "Max tool rounds reached");
        info!(session = %session_id, "Conversation stopped at round limit");
        Ok((session_id, Outcome::RoundLimit))
    }
}

/// Parse tool arguments, replacing anything that is not a JSON object with `{}`.
fn parse_arguments(tool: &str, raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => {
            debug!(tool = %tool, raw = %raw, "Unusable tool arguments, substituting empty object");
            serde_json::json!({})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProvider, tool_call};
    use async_trait::async_trait;
    use relayclaw_core::error::ToolError;
    use relayclaw_core::message::Role;
    use relayclaw_sessions::InMemorySessionStore;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its arguments"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
            Ok(arguments.to_string())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        Arc::new(registry)
    }

    async fn collect(mut rx: mpsc::Receiver<AgentStreamEvent>) -> Vec<AgentStreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn types(events: &[AgentStreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_type()).collect()
    }

    #[tokio::test]
    async fn text_only_conversation_is_one_round() {
        let provider = Arc::new(ScriptedProvider::text("Hello!"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider.clone(), registry(), sessions.clone());

        let events = collect(agent.run_conversation("cli", "me", "hi")).await;
        assert_eq!(types(&events), vec!["text", "done"]);
        assert_eq!(
            events.last(),
            Some(&AgentStreamEvent::Done {
                usage: Some(Usage::new(10, 5))
            })
        );
        assert_eq!(provider.call_count(), 1);

        let msgs = sessions.messages("cli:me").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].content, "Hello!");
    }

    #[tokio::test]
    async fn tool_round_pairs_start_result_and_tool_messages() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                tool_call("c1", "echo", r#"{"a":1}"#),
                tool_call("c2", "echo", r#"{"b":2}"#),
                StreamChunk::Done(Some(Usage::new(5, 5))),
            ],
            vec![StreamChunk::Text("done".into()), StreamChunk::Done(Some(Usage::new(7, 3)))],
        ]));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider.clone(), registry(), sessions.clone());

        let events = collect(agent.run_conversation("cli", "me", "go")).await;
        assert_eq!(
            types(&events),
            vec!["tool_start", "tool_result", "tool_start", "tool_result", "text", "done"]
        );
        assert_eq!(
            events[1],
            AgentStreamEvent::ToolResult {
                tool_name: "echo".into(),
                tool_result: r#"{"a":1}"#.into()
            }
        );
        // Usage is summed across rounds.
        assert_eq!(events.last(), Some(&AgentStreamEvent::Done { usage: Some(Usage::new(12, 8)) }));

        let msgs = sessions.messages("cli:me").await.unwrap();
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(msgs[1].tool_calls.len(), 2);
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("c2"));

        // Second round saw the tool results.
        assert_eq!(provider.histories()[1].len(), 4);
    }

    #[tokio::test]
    async fn round_limit_is_a_soft_stop() {
        let provider = Arc::new(ScriptedProvider::always_tool("echo"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider.clone(), registry(), sessions).with_max_rounds(2);

        let events = collect(agent.run_conversation("cli", "me", "loop")).await;
        assert_eq!(
            types(&events),
            vec!["tool_start", "tool_result", "tool_start", "tool_result", "done"]
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn malformed_arguments_become_empty_object() {
        let provider = Arc::new(ScriptedProvider::tool_then_answer("echo", "{not json", "ok"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider, registry(), sessions);

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        assert_eq!(
            events[0],
            AgentStreamEvent::ToolStart {
                tool_name: "echo".into(),
                tool_args: serde_json::json!({})
            }
        );
        assert_eq!(
            events[1],
            AgentStreamEvent::ToolResult {
                tool_name: "echo".into(),
                tool_result: "{}".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_payload_and_continues() {
        let provider = Arc::new(ScriptedProvider::tool_then_answer("missing", "{}", "sorry"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider, registry(), sessions);

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        match &events[1] {
            AgentStreamEvent::ToolResult { tool_result, .. } => {
                assert!(tool_result.contains("Tool 'missing' not found"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(events.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn provider_error_terminates_with_error_then_done() {
        let provider = Arc::new(ScriptedProvider::failing("API error 500: boom"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider, registry(), sessions.clone());

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        assert_eq!(
            events,
            vec![
                AgentStreamEvent::Error {
                    error: "API error 500: boom".into()
                },
                AgentStreamEvent::Done { usage: None },
            ]
        );
        // Only the user message was stored.
        assert_eq!(sessions.messages("cli:me").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_closing_without_done_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamChunk::Text("half an ans".into())]]));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider, registry(), sessions.clone());

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], AgentStreamEvent::Text { content: "half an ans".into() });
        assert!(matches!(&events[1], AgentStreamEvent::Error { error } if error.contains("without completing")));
        assert_eq!(events[2], AgentStreamEvent::Done { usage: None });
        // The partial round is not persisted.
        assert_eq!(sessions.messages("cli:me").await.unwrap().len(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn get_or_create(
            &self,
            _channel: &str,
            _peer_id: &str,
        ) -> Result<relayclaw_core::session::Session, SessionError> {
            Err(SessionError::Storage("disk full".into()))
        }
        async fn get(&self, _id: &str) -> Result<Option<relayclaw_core::session::Session>, SessionError> {
            Ok(None)
        }
        async fn append(&self, _id: &str, _m: ChatMessage) -> Result<(), SessionError> {
            Ok(())
        }
        async fn messages(&self, _id: &str) -> Result<Vec<ChatMessage>, SessionError> {
            Ok(vec![])
        }
        async fn reset(&self, _id: &str) -> Result<bool, SessionError> {
            Ok(false)
        }
        async fn list(&self) -> Result<Vec<relayclaw_core::session::SessionSummary>, SessionError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn session_failure_surfaces_as_error_then_done() {
        let provider = Arc::new(ScriptedProvider::text("unused"));
        let agent = ConversationLoop::new(provider.clone(), registry(), Arc::new(BrokenStore));

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        assert_eq!(types(&events), vec!["error", "done"]);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn registered_tools_are_available_next_run() {
        let provider = Arc::new(ScriptedProvider::tool_then_answer("late", "{}", "ok"));
        let sessions = Arc::new(InMemorySessionStore::new(50));
        let agent = ConversationLoop::new(provider, Arc::new(ToolRegistry::new()), sessions);

        struct Late;
        #[async_trait]
        impl Tool for Late {
            fn name(&self) -> &str {
                "late"
            }
            fn description(&self) -> &str {
                "Registered after construction"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _a: serde_json::Value) -> Result<String, ToolError> {
                Ok("late result".into())
            }
        }
        agent.register_tool(Arc::new(Late));

        let events = collect(agent.run_conversation("cli", "me", "x")).await;
        assert_eq!(
            events[1],
            AgentStreamEvent::ToolResult {
                tool_name: "late".into(),
                tool_result: "late result".into()
            }
        );
    }

    #[test]
    fn argument_parsing() {
        assert_eq!(parse_arguments("t", r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_arguments("t", ""), serde_json::json!({}));
        assert_eq!(parse_arguments("t", "[1,2]"), serde_json::json!({}));
    }
}
