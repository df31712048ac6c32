//! `GET /v1/ws`: WebChat over WebSocket.
//!
//! Frames are JSON text:
//!
//! - request:  `{ "type": "req", "id": "1", "method": "chat", "params": { "message": "hi" } }`
//! - response: `{ "type": "res", "id": "1", "ok": true, "payload": { ... } }`
//! - event:    `{ "type": "event", "event": "agent_text", "payload": { ... } }`
//!
//! Methods are `chat`, `status` and `reset`. In inline mode `chat` streams
//! `agent_<type>` events back on the same socket. In queued mode the job is
//! enqueued with the client id as correlation id, and the worker's reply
//! arrives later as a `reply` event through the WebChat channel.

use axum::{
    extract::State,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relayclaw_channels::web::webchat_peer_id;
use relayclaw_core::job::Job;
use relayclaw_core::session::session_id;
use relayclaw_dispatch::{DispatchMode, submit};

use crate::SharedState;

pub const WEBCHAT_CHANNEL: &str = "webchat";

const OUTBOUND_BUFFER: usize = 64;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    event: Option<String>,
}

pub fn event_frame(event: &str, payload: Value) -> String {
    json!({ "type": "event", "event": event, "payload": payload }).to_string()
}

pub fn ok_frame(id: &str, payload: Value) -> String {
    json!({ "type": "res", "id": id, "ok": true, "payload": payload }).to_string()
}

pub fn error_frame(id: &str, error: &str) -> String {
    json!({ "type": "res", "id": id, "ok": false, "error": error }).to_string()
}

fn new_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// One connected client. Everything it sends back goes through `out`.
pub struct WsSession {
    pub client_id: String,
    pub peer_id: String,
    state: SharedState,
    out: mpsc::Sender<String>,
}

impl WsSession {
    pub fn new(state: SharedState, out: mpsc::Sender<String>) -> Self {
        let client_id = new_client_id();
        let peer_id = webchat_peer_id(&client_id);
        Self {
            client_id,
            peer_id,
            state,
            out,
        }
    }

    pub fn connected_frame(&self) -> String {
        event_frame(
            "connected",
            json!({ "clientId": self.client_id, "peerId": self.peer_id }),
        )
    }

    async fn send(&self, frame: String) {
        if self.out.send(frame).await.is_err() {
            debug!(client = %self.client_id, "Client writer gone");
        }
    }

    /// Handle one text frame from the client.
    pub async fn handle_text(&self, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(_) => {
                self.send(error_frame("", "Invalid JSON")).await;
                return;
            }
        };

        match frame.frame_type.as_str() {
            "req" => {
                let id = frame.id.unwrap_or_default();
                let method = frame.method.unwrap_or_default();
                self.handle_request(&id, &method, frame.params).await;
            }
            "event" if frame.event.as_deref() == Some("ping") => {
                let ts = chrono::Utc::now().timestamp_millis();
                self.send(event_frame("pong", json!({ "ts": ts }))).await;
            }
            other => {
                debug!(client = %self.client_id, frame_type = %other, "Ignoring frame");
            }
        }
    }

    async fn handle_request(&self, id: &str, method: &str, params: Value) {
        match method {
            "chat" => self.chat(id, params).await,
            "status" => {
                let clients = match &self.state.webchat {
                    Some(ch) => ch.active_clients().await,
                    None => 0,
                };
                let payload = json!({ "uptimeSecs": self.state.uptime_secs(), "clients": clients });
                self.send(ok_frame(id, payload)).await;
            }
            "reset" => {
                let session = session_id(WEBCHAT_CHANNEL, &self.peer_id);
                match self.state.sessions().reset(&session).await {
                    Ok(reset) => self.send(ok_frame(id, json!({ "reset": reset }))).await,
                    Err(e) => self.send(error_frame(id, &e.to_string())).await,
                }
            }
            other => {
                self.send(error_frame(id, &format!("Unknown method: {other}"))).await;
            }
        }
    }

    async fn chat(&self, id: &str, params: Value) {
        let Some(message) = params
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
        else {
            self.send(error_frame(id, "Missing 'message' param")).await;
            return;
        };

        match self.state.mode {
            DispatchMode::Inline => {
                self.send(ok_frame(id, json!({ "status": "streaming" }))).await;
                let mut rx = self
                    .state
                    .conversation
                    .run_conversation(WEBCHAT_CHANNEL, &self.peer_id, message);
                let out = self.out.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let name = format!("agent_{}", event.event_type());
                        let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                        if out.send(event_frame(&name, payload)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            DispatchMode::Queued => {
                let job = Job::new(WEBCHAT_CHANNEL, self.peer_id.clone(), message)
                    .with_correlation_id(self.client_id.clone());
                let detail = json!({ "clientId": self.client_id, "textLength": message.chars().count() });
                match submit(self.state.queue.as_ref(), &self.state.audit, job, Some(detail)).await {
                    Ok(receipt) => {
                        let payload = json!({
                            "status": "queued",
                            "taskId": receipt.task_id,
                            "jobId": receipt.job_id,
                        });
                        self.send(ok_frame(id, payload)).await;
                    }
                    Err(e) => self.send(error_frame(id, &e.to_string())).await,
                }
            }
        }
    }
}

async fn handle_ws_connection(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let session = WsSession::new(state.clone(), out_tx.clone());
    info!(client = %session.client_id, "WebSocket connection established");

    // Replies pushed by the WebChat channel join the same outbound stream.
    let forwarder = match &state.webchat {
        Some(webchat) => {
            let mut pushed = webchat
                .register_client(&session.client_id, &session.peer_id)
                .await;
            let out = out_tx.clone();
            Some(tokio::spawn(async move {
                while let Some(frame) = pushed.recv().await {
                    if out.send(frame).await.is_err() {
                        break;
                    }
                }
            }))
        }
        None => None,
    };
    drop(out_tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    session.send(session.connected_frame()).await;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(client = %session.client_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    if let Some(webchat) = &state.webchat {
        webchat.unregister_client(&session.client_id).await;
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    writer.abort();
    info!(client = %session.client_id, "WebSocket connection closed");
}
