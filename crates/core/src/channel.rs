//! Channel trait: how a finished answer gets back to the user.
//!
//! Inbound traffic reaches RelayClaw through the gateway (HTTP, WebSocket,
//! webhooks). A Channel is the outbound half: given a peer and an optional
//! correlation id (a WebSocket client id, a chat id), deliver one text reply.

use async_trait::async_trait;

use crate::error::ChannelError;

/// The core Channel trait.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name used for routing (e.g., "webchat", "lark", "webhook").
    fn name(&self) -> &str;

    /// Deliver `text` to `peer_id`.
    ///
    /// `Ok(false)` means the target is gone (e.g. the WebSocket client
    /// disconnected) and nothing was delivered; `Err` means delivery was
    /// attempted and failed.
    async fn reply(
        &self,
        correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> std::result::Result<bool, ChannelError>;

    /// Health check: can the channel currently deliver?
    async fn health_check(&self) -> std::result::Result<bool, ChannelError> {
        Ok(true)
    }
}
