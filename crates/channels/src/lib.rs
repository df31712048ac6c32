//! Reply channels for RelayClaw.
//!
//! A channel is the outbound half of a conversation: once a worker has the
//! final answer, the [`ChannelRegistry`] routes it back through the channel
//! the job came from.
//!
//! Available channels:
//! - **WebChat**: push to connected WebSocket clients
//! - **Webhook**: signed POST to a callback URL
//! - **Lark**: text message through the Lark/Feishu Open API
//! - **CLI**: print to stdout

pub mod cli;
pub mod lark;
pub mod registry;
pub mod web;
pub mod webhook;

pub use cli::CliChannel;
pub use lark::{LarkChannel, LarkConfig, LarkInbound, LarkMessage};
pub use registry::ChannelRegistry;
pub use web::WebChatChannel;
pub use webhook::{WebhookChannel, WebhookConfig};

use relayclaw_config::ChannelsConfig;
use std::sync::Arc;

/// Build a registry with every channel enabled in config.
///
/// The CLI channel is always present. The WebChat channel is returned
/// separately as well, since the gateway needs it to attach sockets.
pub fn registry_from_config(config: &ChannelsConfig) -> (ChannelRegistry, Option<Arc<WebChatChannel>>) {
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(CliChannel::new()));

    let webchat = config.webchat.enabled.then(|| Arc::new(WebChatChannel::new()));
    if let Some(ch) = &webchat {
        registry.register(ch.clone());
    }
    if config.webhook.enabled {
        registry.register(Arc::new(WebhookChannel::new((&config.webhook).into())));
    }
    if config.lark.enabled {
        registry.register(Arc::new(LarkChannel::new((&config.lark).into())));
    }
    (registry, webchat)
}
