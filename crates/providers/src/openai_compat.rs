//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI and any endpoint that exposes `/chat/completions` with
//! SSE streaming (OpenRouter, vLLM, Ollama, ...).
//!
//! Text arrives as per-token deltas. Tool calls arrive as fragments that are
//! stitched together in a single in-flight buffer, which is flushed when a
//! fragment with a new call id shows up or when the finish signal fires.

use async_trait::async_trait;
use futures::StreamExt;
use relayclaw_core::error::ProviderError;
use relayclaw_core::message::{ChatMessage, MessageToolCall, Role, Usage};
use relayclaw_core::provider::{StreamChunk, ToolDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::sse::{ChunkSink, SseLine, SseLineBuffer};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new("openai", DEFAULT_BASE_URL, api_key, model)
    }

    /// Convert the transcript to OpenAI API format, system prompt first.
    fn to_api_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(ApiMessage {
                role: "system".into(),
                content: Some(system_prompt.to_string()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for m in messages {
            let api = match m.role {
                Role::Tool => ApiMessage {
                    role: "tool".into(),
                    content: Some(m.content.clone()),
                    tool_calls: None,
                    tool_call_id: Some(m.tool_call_id.clone().unwrap_or_default()),
                },
                Role::Assistant if m.has_tool_calls() => ApiMessage {
                    role: "assistant".into(),
                    content: if m.content.is_empty() { None } else { Some(m.content.clone()) },
                    tool_calls: Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    ),
                    tool_call_id: None,
                },
                role => ApiMessage {
                    role: role.as_str().into(),
                    content: Some(m.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                },
            };
            out.push(api);
        }
        out
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(&self, history: &[ChatMessage], tools: &[ToolDefinition], system_prompt: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(system_prompt, history),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(tools));
        }
        body
    }
}

#[async_trait]
impl relayclaw_core::Provider for OpenAiCompatProvider {
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(history, tools, system_prompt);

        debug!(provider = %self.name, model = %self.model, "Sending streaming request");

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body);
        let provider_name = self.name.clone();
        let (mut sink, rx) = ChunkSink::channel();

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(provider = %provider_name, error = %e, "Request failed");
                    sink.error(ProviderError::Network(e.to_string()).to_string()).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                warn!(provider = %provider_name, status = status.as_u16(), body = %error_body, "Provider streaming error");
                let err = ProviderError::ApiError { status_code: status.as_u16(), message: error_body };
                sink.error(err.to_string()).await;
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::new();
            let mut acc = DeltaAccumulator::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        sink.error(ProviderError::StreamInterrupted(e.to_string()).to_string()).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    if forward(&mut sink, acc.on_line(&provider_name, line)).await {
                        return;
                    }
                }
            }

            if let Some(line) = lines.finish() {
                if forward(&mut sink, acc.on_line(&provider_name, line)).await {
                    return;
                }
            }
            // Stream ended without [DONE]
            forward(&mut sink, acc.on_end()).await;
        });

        rx
    }
}

/// Send chunks in order. Returns true once the stream is finished.
async fn forward(sink: &mut ChunkSink, chunks: Vec<StreamChunk>) -> bool {
    for chunk in chunks {
        sink.send(chunk).await;
        if sink.is_closed() {
            return true;
        }
    }
    false
}

/// A tool call whose fragments are still arriving.
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns decoded SSE payloads into normalized chunks.
#[derive(Debug, Default)]
struct DeltaAccumulator {
    pending: Option<PendingToolCall>,
    finished: bool,
    usage: Option<Usage>,
}

impl DeltaAccumulator {
    fn on_line(&mut self, provider: &str, line: SseLine) -> Vec<StreamChunk> {
        let SseLine::Data(data) = line else {
            return Vec::new();
        };
        if data == "[DONE]" {
            return self.on_end();
        }
        match serde_json::from_str::<StreamResponse>(&data) {
            Ok(resp) => self.on_response(resp),
            Err(e) => {
                trace!(provider = %provider, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                Vec::new()
            }
        }
    }

    fn on_response(&mut self, resp: StreamResponse) -> Vec<StreamChunk> {
        let mut out = Vec::new();

        if let Some(err) = resp.error {
            out.push(StreamChunk::Error(err.message));
            return out;
        }

        if let Some(choice) = resp.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamChunk::Text(content));
            }

            for tc in choice.delta.tool_calls.unwrap_or_default() {
                if let Some(id) = tc.id {
                    let is_new = self.pending.as_ref().is_none_or(|p| p.id != id);
                    if is_new {
                        self.flush(&mut out);
                        self.pending = Some(PendingToolCall { id, ..Default::default() });
                    }
                }
                let pending = self.pending.get_or_insert_with(PendingToolCall::default);
                if let Some(func) = tc.function {
                    if let Some(name) = func.name.filter(|n| !n.is_empty()) {
                        pending.name = name;
                    }
                    if let Some(args) = func.arguments {
                        pending.arguments.push_str(&args);
                    }
                }
            }

            if choice.finish_reason.is_some() {
                self.flush(&mut out);
                self.finished = true;
            }
        }

        if let Some(u) = resp.usage {
            self.usage = Some(Usage::new(u.prompt_tokens, u.completion_tokens));
            if self.finished {
                out.push(StreamChunk::Done(self.usage));
            }
        }

        out
    }

    /// End of stream, either `[DONE]` or the body closing.
    fn on_end(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        self.flush(&mut out);
        out.push(StreamChunk::Done(self.usage));
        out
    }

    /// Emit the in-flight tool call if it has both an id and a name.
    fn flush(&mut self, out: &mut Vec<StreamChunk>) {
        let Some(p) = self.pending.take() else {
            return;
        };
        if p.id.is_empty() || p.name.is_empty() {
            trace!(id = %p.id, name = %p.name, "Dropping incomplete tool call");
            return;
        }
        out.push(StreamChunk::ToolCall(MessageToolCall {
            id: p.id,
            name: p.name,
            arguments: p.arguments,
        }));
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
