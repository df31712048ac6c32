//! CLI channel: prints replies to stdout.
//!
//! Used by `relayclaw worker` when jobs were enqueued from the terminal.

use async_trait::async_trait;
use relayclaw_core::channel::Channel;
use relayclaw_core::error::ChannelError;
use std::io::Write;

pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// How a reply is rendered on the terminal.
pub fn format_reply(peer_id: &str, text: &str) -> String {
    format!("[{peer_id}] {text}")
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn reply(
        &self,
        _correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> Result<bool, ChannelError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", format_reply(peer_id, text)).map_err(|e| {
            ChannelError::DeliveryFailed {
                channel: "cli".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(true)
    }
}
