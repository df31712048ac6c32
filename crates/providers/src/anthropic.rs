//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE, folded into a [`MessageSnapshot`]
//!
//! Tool calls are read from the snapshot rather than from the deltas: at
//! every `content_block_stop` the snapshot is re-scanned and each finished
//! `tool_use` block that has not been emitted yet is emitted once.

use async_trait::async_trait;
use futures::StreamExt;
use relayclaw_core::error::ProviderError;
use relayclaw_core::message::{ChatMessage, MessageToolCall, Role, Usage};
use relayclaw_core::provider::{StreamChunk, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::sse::{ChunkSink, SseLine, SseLineBuffer};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert the transcript to Anthropic content-block messages.
    ///
    /// System messages are skipped; the prompt travels in the top-level
    /// `system` field instead.
    fn to_api_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
        let mut result = Vec::new();

        for msg in messages {
            match msg.role {
                Role::User => result.push(AnthropicMessage {
                    role: "user".into(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                Role::Assistant if msg.has_tool_calls() => {
                    let mut blocks: Vec<ContentBlock> = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(ContentBlock::Text { text: msg.content.clone() });
                    }
                    for tc in &msg.tool_calls {
                        let input: serde_json::Value = serde_json::from_str(&tc.arguments)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        blocks.push(ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input,
                        });
                    }
                    result.push(AnthropicMessage {
                        role: "assistant".into(),
                        content: AnthropicContent::Blocks(blocks),
                    });
                }
                Role::Assistant => result.push(AnthropicMessage {
                    role: "assistant".into(),
                    content: AnthropicContent::Text(msg.content.clone()),
                }),
                Role::Tool => result.push(AnthropicMessage {
                    role: "user".into(),
                    content: AnthropicContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                    }]),
                }),
                Role::System => {}
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn request_body(&self, history: &[ChatMessage], tools: &[ToolDefinition], system_prompt: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(history),
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });
        if !system_prompt.is_empty() {
            body["system"] = serde_json::json!(system_prompt);
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(tools));
        }
        body
    }
}

#[async_trait]
impl relayclaw_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDefinition],
        system_prompt: &str,
    ) -> mpsc::Receiver<StreamChunk> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(history, tools, system_prompt);

        debug!(provider = "anthropic", model = %self.model, "Sending streaming request");

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
            .json(&body);
        let (mut sink, rx) = ChunkSink::channel();

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(provider = "anthropic", error = %e, "Request failed");
                    sink.error(ProviderError::Network(e.to_string()).to_string()).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                warn!(provider = "anthropic", status = status.as_u16(), body = %error_body, "Provider streaming error");
                let err = ProviderError::ApiError { status_code: status.as_u16(), message: error_body };
                sink.error(err.to_string()).await;
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::new();
            let mut reader = SnapshotReader::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        sink.error(ProviderError::StreamInterrupted(e.to_string()).to_string()).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    for chunk in reader.on_line(line) {
                        sink.send(chunk).await;
                    }
                    if sink.is_closed() {
                        return;
                    }
                }
            }
            if let Some(line) = lines.finish() {
                for chunk in reader.on_line(line) {
                    sink.send(chunk).await;
                }
            }

            if !sink.is_closed() {
                sink.error(ProviderError::StreamInterrupted("stream ended before message_stop".into()).to_string())
                    .await;
            }
        });

        rx
    }
}

/// The message as accumulated so far from stream events.
#[derive(Debug, Default, Clone)]
pub struct MessageSnapshot {
    pub content: Vec<SnapshotBlock>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SnapshotBlock {
    Text { text: String },
    ToolUse { id: String, name: String, partial_json: String, complete: bool },
    Other,
}

impl MessageSnapshot {
    fn block_mut(&mut self, index: usize) -> Option<&mut SnapshotBlock> {
        self.content.get_mut(index)
    }

    fn usage(&self) -> Usage {
        Usage::new(self.input_tokens, self.output_tokens)
    }
}

/// Folds SSE events into a [`MessageSnapshot`] and derives chunks from it.
#[derive(Debug, Default)]
struct SnapshotReader {
    event: Option<String>,
    snapshot: MessageSnapshot,
    emitted: HashSet<String>,
}

impl SnapshotReader {
    fn on_line(&mut self, line: SseLine) -> Vec<StreamChunk> {
        match line {
            SseLine::Event(name) => {
                self.event = Some(name);
                Vec::new()
            }
            SseLine::Data(data) => {
                let event: StreamEvent = match serde_json::from_str(&data) {
                    Ok(e) => e,
                    Err(e) => {
                        trace!(error = %e, event = ?self.event, data = %data, "Ignoring unparseable Anthropic SSE");
                        return Vec::new();
                    }
                };
                self.event = None;
                self.on_event(event)
            }
        }
    }

    fn on_event(&mut self, event: StreamEvent) -> Vec<StreamChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.snapshot.input_tokens = message.usage.input_tokens;
                self.snapshot.output_tokens = message.usage.output_tokens;
                Vec::new()
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                let block = match content_block {
                    StartBlock::Text { text } => SnapshotBlock::Text { text },
                    StartBlock::ToolUse { id, name } => SnapshotBlock::ToolUse {
                        id,
                        name,
                        partial_json: String::new(),
                        complete: false,
                    },
                    StartBlock::Other => SnapshotBlock::Other,
                };
                if index >= self.snapshot.content.len() {
                    self.snapshot.content.resize(index, SnapshotBlock::Other);
                    self.snapshot.content.push(block);
                } else {
                    self.snapshot.content[index] = block;
                }
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if let Some(SnapshotBlock::Text { text: acc }) = self.snapshot.block_mut(index) {
                        acc.push_str(&text);
                    }
                    vec![StreamChunk::Text(text)]
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(SnapshotBlock::ToolUse { partial_json: acc, .. }) = self.snapshot.block_mut(index) {
                        acc.push_str(&partial_json);
                    }
                    Vec::new()
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(SnapshotBlock::ToolUse { complete, .. }) = self.snapshot.block_mut(index) {
                    *complete = true;
                }
                self.unemitted_tool_calls()
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    self.snapshot.output_tokens = u.output_tokens;
                    if let Some(input) = u.input_tokens {
                        self.snapshot.input_tokens = input;
                    }
                }
                self.snapshot.stop_reason = delta.stop_reason;
                Vec::new()
            }
            StreamEvent::MessageStop => vec![StreamChunk::Done(Some(self.snapshot.usage()))],
            StreamEvent::Error { error } => vec![StreamChunk::Error(error.message)],
            StreamEvent::Ping | StreamEvent::Other => Vec::new(),
        }
    }

    /// Finished `tool_use` blocks in the snapshot that were not emitted yet.
    fn unemitted_tool_calls(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        for block in &self.snapshot.content {
            if let SnapshotBlock::ToolUse { id, name, partial_json, complete: true } = block {
                if !self.emitted.insert(id.clone()) {
                    continue;
                }
                let arguments = if partial_json.trim().is_empty() {
                    "{}".to_string()
                } else {
                    partial_json.clone()
                };
                out.push(StreamChunk::ToolCall(MessageToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments,
                }));
            }
        }
        out
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// --- Streaming event types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockStart { index: usize, content_block: StartBlock },
    ContentBlockDelta { index: usize, delta: BlockDelta },
    ContentBlockStop { index: usize },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: StartUsage,
}

#[derive(Debug, Default, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayclaw_core::Provider;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(events: &[(&str, serde_json::Value)]) -> String {
        events
            .iter()
            .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
            .collect()
    }

    fn tool_round() -> String {
        sse(&[
            ("message_start", serde_json::json!({"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}})),
            ("content_block_start", serde_json::json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}})),
            ("content_block_stop", serde_json::json!({"type":"content_block_stop","index":0})),
            ("content_block_start", serde_json::json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_current_datetime","input":{}}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"timezone\":"}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"UTC\"}"}})),
            ("content_block_stop", serde_json::json!({"type":"content_block_stop","index":1})),
            ("content_block_start", serde_json::json!({"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_2","name":"web_search","input":{}}})),
            ("content_block_stop", serde_json::json!({"type":"content_block_stop","index":2})),
            ("ping", serde_json::json!({"type":"ping"})),
            ("message_delta", serde_json::json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":30}})),
            ("message_stop", serde_json::json!({"type":"message_stop"})),
        ])
    }

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await {
            out.push(c);
        }
        out
    }

    #[test]
    fn constructor_with_base_url() {
        let p = AnthropicProvider::new("sk-ant", "claude-sonnet-4-20250514").with_base_url("http://localhost:9999/");
        assert_eq!(p.base_url, "http://localhost:9999");
        assert_eq!(p.name(), "anthropic");
    }

    #[test]
    fn system_messages_are_skipped_and_prompt_is_top_level() {
        let p = AnthropicProvider::new("k", "m");
        let body = p.request_body(&[ChatMessage::system("old"), ChatMessage::user("hi")], &[], "Be kind");
        assert_eq!(body["system"], "Be kind");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn tool_result_becomes_user_block() {
        let msgs = AnthropicProvider::to_api_messages(&[ChatMessage::tool_result("toolu_1", "42")]);
        let json = serde_json::to_value(&msgs[0]).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn assistant_tool_calls_become_blocks() {
        let msg = ChatMessage::assistant_with_tools(
            "Let me check",
            vec![MessageToolCall { id: "toolu_1".into(), name: "run_shell".into(), arguments: "not json".into() }],
        );
        let json = serde_json::to_value(&AnthropicProvider::to_api_messages(&[msg])[0]).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "tool_use");
        assert_eq!(json["content"][1]["input"], serde_json::json!({}));
    }

    #[test]
    fn snapshot_emits_each_tool_use_once() {
        let mut reader = SnapshotReader::default();
        let mut lines = SseLineBuffer::new();
        let chunks: Vec<StreamChunk> = lines
            .push(tool_round().as_bytes())
            .into_iter()
            .flat_map(|l| reader.on_line(l))
            .collect();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("Checking".into()),
                StreamChunk::ToolCall(MessageToolCall {
                    id: "toolu_1".into(),
                    name: "get_current_datetime".into(),
                    arguments: r#"{"timezone":"UTC"}"#.into(),
                }),
                StreamChunk::ToolCall(MessageToolCall {
                    id: "toolu_2".into(),
                    name: "web_search".into(),
                    arguments: "{}".into(),
                }),
                StreamChunk::Done(Some(Usage::new(12, 30))),
            ]
        );
        assert_eq!(reader.snapshot.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn error_event_becomes_error_chunk() {
        let mut reader = SnapshotReader::default();
        let out = reader.on_line(SseLine::Data(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#.into(),
        ));
        assert_eq!(out, vec![StreamChunk::Error("Overloaded".into())]);
    }

    #[tokio::test]
    async fn streams_from_http_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(tool_round(), "text/event-stream"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("sk-ant", "claude-sonnet-4-20250514").with_base_url(server.uri());
        let chunks = collect(provider.chat(&[ChatMessage::user("time?")], &[], "sys").await).await;
        assert_eq!(chunks.len(), 4);
        assert!(matches!(chunks.last(), Some(StreamChunk::Done(Some(_)))));
    }

    #[tokio::test]
    async fn truncated_stream_ends_in_error() {
        let server = MockServer::start().await;
        let body = sse(&[(
            "content_block_delta",
            serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"par"}}),
        )]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("k", "m").with_base_url(server.uri());
        let chunks = collect(provider.chat(&[ChatMessage::user("x")], &[], "").await).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], StreamChunk::Text("par".into()));
        assert!(matches!(&chunks[1], StreamChunk::Error(e) if e.contains("message_stop")));
    }
}
