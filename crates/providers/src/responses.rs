//! Buffered Responses-API provider.
//!
//! Some gateways only expose the non-streaming `/responses` endpoint with
//! key-in-query auth (`?ak=...`) and sit behind redirecting load balancers.
//! reqwest's automatic redirects would replay a POST as GET on 301/302, so
//! this adapter disables them and re-issues the POST itself, keeping method
//! and body, for up to `max_redirects` hops.
//!
//! The full response is replayed as chunks: text parts, then function calls,
//! then `Done` with usage.

use async_trait::async_trait;
use relayclaw_core::error::ProviderError;
use relayclaw_core::message::{ChatMessage, MessageToolCall, Role, Usage};
use relayclaw_core::provider::{StreamChunk, ToolDefinition};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sse::ChunkSink;

pub const DEFAULT_MAX_REDIRECTS: usize = 3;

pub struct ResponsesProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    max_redirects: usize,
    client: reqwest::Client,
}

impl ResponsesProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();

        Self {
            name: "responses".into(),
            base_url: normalize_base_url(&base_url.into()),
            api_key: api_key.into(),
            model: model.into(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            client,
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    fn endpoint(&self) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!("{}/responses", self.base_url))
            .map_err(|e| ProviderError::NotConfigured(format!("invalid base URL '{}': {e}", self.base_url)))?;
        url.query_pairs_mut().append_pair("ak", &self.api_key);
        Ok(url)
    }

    fn to_input(messages: &[ChatMessage]) -> Vec<InputItem> {
        let mut input = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role {
                Role::System => {}
                Role::Tool => input.push(InputItem::FunctionCallOutput {
                    r#type: "function_call_output",
                    call_id: msg.tool_call_id.clone().unwrap_or_default(),
                    output: msg.content.clone(),
                }),
                Role::Assistant => {
                    if !msg.has_tool_calls() || !msg.content.is_empty() {
                        input.push(InputItem::Message {
                            role: "assistant",
                            content: vec![ContentPart { r#type: "output_text", text: msg.content.clone() }],
                        });
                    }
                    for tc in &msg.tool_calls {
                        input.push(InputItem::FunctionCall {
                            r#type: "function_call",
                            call_id: tc.id.clone(),
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        });
                    }
                }
                Role::User => input.push(InputItem::Message {
                    role: "user",
                    content: vec![ContentPart { r#type: "input_text", text: msg.content.clone() }],
                }),
            }
        }
        input
    }

    fn request_body(&self, history: &[ChatMessage], tools: &[ToolDefinition], system_prompt: &str) -> RequestBody {
        RequestBody {
            model: self.model.clone(),
            input: Self::to_input(history),
            stream: false,
            instructions: (!system_prompt.is_empty()).then(|| system_prompt.to_string()),
            tools: tools
                .iter()
                .map(|t| ApiTool {
                    r#type: "function",
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }
    }
}

/// Strip a trailing `/v1` (and slashes): the endpoint is `{base}/responses`.
fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed).trim_end_matches('/').to_string()
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 307 | 308)
}

/// POST `body` to `url`, re-issuing the same POST on redirects.
///
/// At most `max_redirects` hops are followed; one more redirect fails with
/// [`ProviderError::TooManyRedirects`].
pub async fn post_with_redirect<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: Url,
    body: &B,
    max_redirects: usize,
) -> Result<reqwest::Response, ProviderError> {
    let mut current = url;
    for _ in 0..=max_redirects {
        let response = client
            .post(current.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !is_redirect(status) {
            return Ok(response);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::MissingRedirectLocation { status_code: status })?;
        let next = current
            .join(location)
            .map_err(|e| ProviderError::InvalidResponse(format!("bad redirect location '{location}': {e}")))?;
        debug!(status, to = %next.path(), "Following redirect");
        current = next;
    }
    Err(ProviderError::TooManyRedirects { max: max_redirects })
}

/// Replay a complete response body as normalized chunks.
fn to_chunks(resp: ResponsesApiResponse) -> Vec<StreamChunk> {
    if let Some(err) = resp.error {
        return vec![StreamChunk::Error(err.message)];
    }

    let mut out = Vec::new();
    let stamp = chrono::Utc::now().timestamp_millis();
    for (index, item) in resp.output.into_iter().enumerate() {
        match item.r#type.as_str() {
            "message" => {
                for part in item.content.unwrap_or_default() {
                    if part.r#type == "output_text" {
                        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                            out.push(StreamChunk::Text(text));
                        }
                    }
                }
            }
            "function_call" => {
                let Some(name) = item.name.filter(|n| !n.is_empty()) else {
                    continue;
                };
                let id = item
                    .call_id
                    .or(item.id)
                    .unwrap_or_else(|| format!("tc_{stamp}_{index}"));
                out.push(StreamChunk::ToolCall(MessageToolCall {
                    id,
                    name,
                    arguments: item.arguments.unwrap_or_else(|| "{}".to_string()),
                }));
            }
            _ => {}
        }
    }

    let usage = resp.usage.map(|u| Usage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: u.total_tokens,
    });
    out.push(StreamChunk::Done(usage));
    out
}

#[async_trait]
impl relayclaw_core::Provider for ResponsesProvider {
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
        let (mut sink, rx) = ChunkSink::channel();
        let url = match self.endpoint() {
            Ok(u) => u,
            Err(e) => {
                sink.error(e.to_string()).await;
                return rx;
            }
        };
        let body = self.request_body(history, tools, system_prompt);
        let client = self.client.clone();
        let max_redirects = self.max_redirects;

        debug!(provider = %self.name, model = %self.model, "Sending request");

        tokio::spawn(async move {
            let response = match post_with_redirect(&client, url, &body, max_redirects).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(provider = "responses", error = %e, "Request failed");
                    sink.error(e.to_string()).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                warn!(provider = "responses", status = status.as_u16(), body = %error_body, "API request failed");
                let err = ProviderError::ApiError { status_code: status.as_u16(), message: error_body };
                sink.error(err.to_string()).await;
                return;
            }

            let parsed: ResponsesApiResponse = match response.json().await {
                Ok(p) => p,
                Err(e) => {
                    sink.error(ProviderError::InvalidResponse(e.to_string()).to_string()).await;
                    return;
                }
            };

            for chunk in to_chunks(parsed) {
                sink.send(chunk).await;
                if sink.is_closed() {
                    return;
                }
            }
        });

        rx
    }
}

// --- Responses API types ---

#[derive(Debug, Serialize)]
struct RequestBody {
    model: String,
    input: Vec<InputItem>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum InputItem {
    Message {
        role: &'static str,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        r#type: &'static str,
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        r#type: &'static str,
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
struct ContentPart {
    r#type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    r#type: &'static str,
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ResponsesApiResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    error: Option<ResponsesError>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    r#type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<Vec<OutputContent>>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    input_tokens: u32,
    output_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ResponsesError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayclaw_core::Provider;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(c) = rx.recv().await {
            out.push(c);
        }
        out
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "It is noon."}]},
                {"type": "function_call", "call_id": "call_9", "name": "get_current_datetime", "arguments": "{\"timezone\":\"UTC\"}"}
            ],
            "usage": {"input_tokens": 5, "output_tokens": 7, "total_tokens": 12}
        })
    }

    #[test]
    fn base_url_drops_trailing_v1() {
        assert_eq!(normalize_base_url("https://gw.example.com/v1/"), "https://gw.example.com");
        assert_eq!(normalize_base_url("https://gw.example.com/api/"), "https://gw.example.com/api");
    }

    #[test]
    fn endpoint_carries_key_in_query() {
        let p = ResponsesProvider::new("https://gw.example.com/v1", "a&b", "m");
        let url = p.endpoint().unwrap();
        assert_eq!(url.path(), "/responses");
        assert_eq!(url.query(), Some("ak=a%26b"));
    }

    #[test]
    fn input_mapping() {
        let history = vec![
            ChatMessage::system("ignored"),
            ChatMessage::user("time?"),
            ChatMessage::assistant_with_tools(
                "",
                vec![MessageToolCall { id: "call_1".into(), name: "get_current_datetime".into(), arguments: "{}".into() }],
            ),
            ChatMessage::tool_result("call_1", "{\"iso\":\"x\"}"),
            ChatMessage::assistant("noon"),
        ];
        let json = serde_json::to_value(ResponsesProvider::to_input(&history)).unwrap();
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0]["content"][0]["type"], "input_text");
        assert_eq!(items[1]["type"], "function_call");
        assert_eq!(items[1]["call_id"], "call_1");
        assert_eq!(items[2]["type"], "function_call_output");
        assert_eq!(items[3]["role"], "assistant");
        assert_eq!(items[3]["content"][0]["type"], "output_text");
    }

    #[test]
    fn output_replay_and_id_fallbacks() {
        let resp: ResponsesApiResponse = serde_json::from_value(serde_json::json!({
            "output": [
                {"type": "function_call", "id": "fc_1", "name": "a"},
                {"type": "function_call", "name": "b", "arguments": "{\"x\":1}"},
                {"type": "function_call", "call_id": "c"}
            ]
        }))
        .unwrap();
        let chunks = to_chunks(resp);
        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], StreamChunk::ToolCall(tc) if tc.id == "fc_1" && tc.arguments == "{}"));
        assert!(matches!(&chunks[1], StreamChunk::ToolCall(tc) if tc.id.starts_with("tc_")));
        assert_eq!(chunks[2], StreamChunk::Done(None));
    }

    #[test]
    fn idless_calls_get_distinct_ids() {
        let resp: ResponsesApiResponse = serde_json::from_value(serde_json::json!({
            "output": [
                {"type": "function_call", "name": "get_current_datetime"},
                {"type": "function_call", "name": "run_shell", "arguments": "{\"command\":\"ls\"}"}
            ]
        }))
        .unwrap();
        let ids: Vec<String> = to_chunks(resp)
            .into_iter()
            .filter_map(|c| match c {
                StreamChunk::ToolCall(tc) => Some(tc.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn body_error_becomes_error_chunk() {
        let resp: ResponsesApiResponse =
            serde_json::from_value(serde_json::json!({"error": {"message": "quota", "code": "429"}})).unwrap();
        assert_eq!(to_chunks(resp), vec![StreamChunk::Error("quota".into())]);
    }

    #[tokio::test]
    async fn replays_buffered_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(query_param("ak", "key"))
            .and(body_partial_json(serde_json::json!({"model": "m", "stream": false, "instructions": "sys"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(format!("{}/v1", server.uri()), "key", "m");
        let chunks = collect(provider.chat(&[ChatMessage::user("time?")], &[], "sys").await).await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("It is noon.".into()),
                StreamChunk::ToolCall(MessageToolCall {
                    id: "call_9".into(),
                    name: "get_current_datetime".into(),
                    arguments: "{\"timezone\":\"UTC\"}".into(),
                }),
                StreamChunk::Done(Some(Usage { prompt_tokens: 5, completion_tokens: 7, total_tokens: 12 })),
            ]
        );
    }

    #[tokio::test]
    async fn follows_redirect_preserving_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/moved/responses?ak=key"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/moved/responses"))
            .and(body_partial_json(serde_json::json!({"model": "m"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(server.uri(), "key", "m");
        let chunks = collect(provider.chat(&[ChatMessage::user("hi")], &[], "").await).await;
        assert!(matches!(chunks.last(), Some(StreamChunk::Done(Some(_)))));
    }

    #[tokio::test]
    async fn too_many_redirects_is_a_single_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/responses"))
            .expect(4)
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(server.uri(), "key", "m").with_max_redirects(3);
        let chunks = collect(provider.chat(&[ChatMessage::user("hi")], &[], "").await).await;
        assert_eq!(chunks, vec![StreamChunk::Error("Too many redirects (max 3)".into())]);
    }

    #[tokio::test]
    async fn redirect_without_location_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(301))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(server.uri(), "key", "m");
        let chunks = collect(provider.chat(&[ChatMessage::user("hi")], &[], "").await).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error(e) if e.contains("without Location")));
    }

    #[tokio::test]
    async fn non_success_status_reports_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(server.uri(), "key", "m");
        let chunks = collect(provider.chat(&[ChatMessage::user("hi")], &[], "").await).await;
        assert_eq!(chunks, vec![StreamChunk::Error("API error 500: upstream down".into())]);
    }
}
