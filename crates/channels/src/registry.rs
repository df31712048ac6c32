//! Channel registry: routes replies to the channel a job came from.

use std::collections::HashMap;
use std::sync::Arc;

use relayclaw_core::channel::Channel;
use relayclaw_core::error::ChannelError;
use tracing::{info, warn};

/// All enabled channels, keyed by name.
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel. A channel with the same name is replaced.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "Registered channel");
        self.channels.insert(name, channel);
    }

    /// Get a channel by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    /// Registered channel names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver a reply through the named channel.
    ///
    /// An unknown channel is not an error: nothing can be delivered, so the
    /// result is `Ok(false)`.
    pub async fn reply(
        &self,
        channel_name: &str,
        correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> Result<bool, ChannelError> {
        match self.channels.get(channel_name) {
            Some(channel) => channel.reply(correlation_id, peer_id, text).await,
            None => {
                warn!(channel = %channel_name, peer = %peer_id, "No such channel, reply dropped");
                Ok(false)
            }
        }
    }

    /// Run health checks on all channels.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, channel) in &self.channels {
            let healthy = channel.health_check().await.unwrap_or(false);
            results.insert(name.clone(), healthy);
        }
        results
    }
}
