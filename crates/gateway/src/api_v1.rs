//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`: Send a message, wait for the whole answer
//! - `POST /v1/chat/stream`: Send a message, get an SSE stream
//! - `GET  /v1/ws`: WebSocket (see [`crate::ws`])
//! - `POST /v1/messages`: Queue a message for a worker
//! - `GET  /v1/sessions`: List sessions
//! - `POST /v1/sessions/{id}/reset`: Clear a session transcript
//! - `GET  /v1/tools`: List available tools
//! - `GET  /v1/status`: Runtime status

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use relayclaw_core::job::{Job, Priority, QueueStats};
use relayclaw_core::provider::ToolDefinition;
use relayclaw_core::session::SessionSummary;
use relayclaw_dispatch::{DispatchMode, run_inline, submit};

use crate::{SharedState, error_response, ws};

/// Channel name used for direct API callers.
pub const API_CHANNEL: &str = "api";

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/messages", post(enqueue_message_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{id}/reset", post(reset_session_handler))
        .route("/tools", get(list_tools_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ── Chat ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_peer")]
    pub peer_id: String,
    #[serde(default = "default_api_channel")]
    pub channel: String,
}

fn default_peer() -> String {
    "anonymous".into()
}

fn default_api_channel() -> String {
    API_CHANNEL.into()
}

fn validate_message(message: &str) -> Result<(), Response> {
    if message.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "'message' must not be empty"));
    }
    Ok(())
}

/// `POST /v1/chat`  run the conversation inline and return the collected reply.
async fn chat_handler(State(state): State<SharedState>, Json(payload): Json<ChatRequest>) -> Response {
    if let Err(rejection) = validate_message(&payload.message) {
        return rejection;
    }
    info!(channel = %payload.channel, peer = %payload.peer_id, "v1/chat request");

    let reply = run_inline(&state.conversation, &payload.channel, &payload.peer_id, &payload.message).await;
    if let Some(e) = &reply.error {
        error!(peer = %payload.peer_id, error = %e, "Inline conversation failed");
        return (StatusCode::BAD_GATEWAY, Json(reply)).into_response();
    }
    Json(reply).into_response()
}

/// `POST /v1/chat/stream`  SSE stream of agent events, named by event type.
async fn chat_stream_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    validate_message(&payload.message)?;
    info!(channel = %payload.channel, peer = %payload.peer_id, "v1/chat/stream SSE request");

    let rx = state
        .conversation
        .run_conversation(&payload.channel, &payload.peer_id, &payload.message);

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });
    Ok(Sse::new(stream))
}

// ── Queue ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub message: String,
    pub peer_id: String,
    #[serde(default = "default_api_channel")]
    pub channel: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub task_id: String,
    pub job_id: String,
}

/// `POST /v1/messages`  queue a message; a worker replies through `channel`.
async fn enqueue_message_handler(
    State(state): State<SharedState>,
    Json(payload): Json<EnqueueRequest>,
) -> Response {
    if let Err(rejection) = validate_message(&payload.message) {
        return rejection;
    }

    let mut job = Job::new(payload.channel, payload.peer_id, payload.message).with_priority(payload.priority);
    if let Some(task_id) = payload.task_id.filter(|t| !t.is_empty()) {
        job = job.with_task_id(task_id);
    }
    if let Some(correlation_id) = payload.correlation_id {
        job = job.with_correlation_id(correlation_id);
    }
    let detail = serde_json::json!({ "textLength": job.content.chars().count() });

    match submit(state.queue.as_ref(), &state.audit, job, Some(detail)).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(EnqueueResponse {
                task_id: receipt.task_id,
                job_id: receipt.job_id,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Enqueue failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

async fn list_sessions_handler(State(state): State<SharedState>) -> Response {
    match state.sessions().list().await {
        Ok(sessions) => Json(SessionListResponse { sessions }).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn reset_session_handler(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    match state.sessions().reset(&id).await {
        Ok(true) => {
            info!(session = %id, "Session reset");
            Json(serde_json::json!({ "ok": true, "sessionId": id })).into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, format!("Session '{id}' not found")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Tools ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let tools = state.conversation.tools().definitions();
    Json(ToolListResponse {
        count: tools.len(),
        tools,
    })
}

// ── Status ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub provider: String,
    pub model: String,
    pub mode: String,
    pub tools_count: usize,
    pub channels: Vec<String>,
    pub webchat_clients: usize,
    pub queue: QueueStats,
}

async fn status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    let provider = state.conversation.provider();
    let webchat_clients = match &state.webchat {
        Some(ch) => ch.active_clients().await,
        None => 0,
    };
    let queue = state.queue.stats().await.unwrap_or_default();

    Json(StatusResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.uptime_secs(),
        provider: provider.name().into(),
        model: provider.model().into(),
        mode: match state.mode {
            DispatchMode::Inline => "inline".into(),
            DispatchMode::Queued => "queued".into(),
        },
        tools_count: state.conversation.tools().len(),
        channels: state.channels.list(),
        webchat_clients,
        queue,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────
