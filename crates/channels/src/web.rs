//! WebChat channel. Pushes replies to connected WebSocket clients.
//!
//! The gateway registers each socket under its client id and drains the
//! returned receiver into the socket. Queued replies find their client by
//! correlation id, falling back to the peer id.

use async_trait::async_trait;
use relayclaw_core::channel::Channel;
use relayclaw_core::error::ChannelError;
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

const CLIENT_BUFFER: usize = 64;

struct Client {
    peer_id: String,
    tx: mpsc::Sender<String>,
}

/// In-process registry of WebSocket clients.
#[derive(Default)]
pub struct WebChatChannel {
    clients: RwLock<HashMap<String, Client>>,
}

/// Peer id used for a WebSocket client.
pub fn webchat_peer_id(client_id: &str) -> String {
    format!("webchat:{client_id}")
}

/// The frame pushed to a client for a queued reply.
pub fn reply_frame(peer_id: &str, text: &str) -> String {
    serde_json::json!({
        "type": "event",
        "event": "reply",
        "payload": { "peerId": peer_id, "text": text },
    })
    .to_string()
}

impl WebChatChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client. Frames sent to it arrive on the receiver.
    pub async fn register_client(&self, client_id: &str, peer_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.write().await.insert(
            client_id.to_string(),
            Client {
                peer_id: peer_id.to_string(),
                tx,
            },
        );
        info!(client = %client_id, "WebChat client connected");
        rx
    }

    pub async fn unregister_client(&self, client_id: &str) {
        if self.clients.write().await.remove(client_id).is_some() {
            info!(client = %client_id, "WebChat client disconnected");
        }
    }

    pub async fn active_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Push a raw frame to a client. Returns false when it is not connected.
    pub async fn push(&self, client_id: &str, frame: String) -> bool {
        let tx = match self.clients.read().await.get(client_id) {
            Some(c) => c.tx.clone(),
            None => return false,
        };
        tx.send(frame).await.is_ok()
    }
}

#[async_trait]
impl Channel for WebChatChannel {
    fn name(&self) -> &str {
        "webchat"
    }

    async fn reply(
        &self,
        correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> Result<bool, ChannelError> {
        let target = {
            let clients = self.clients.read().await;
            correlation_id
                .and_then(|id| clients.get(id).map(|c| c.tx.clone()))
                .or_else(|| {
                    clients
                        .values()
                        .find(|c| c.peer_id == peer_id)
                        .map(|c| c.tx.clone())
                })
        };

        match target {
            Some(tx) => Ok(tx.send(reply_frame(peer_id, text)).await.is_ok()),
            None => {
                debug!(peer = %peer_id, "No connected WebChat client for reply");
                Ok(false)
            }
        }
    }
}
