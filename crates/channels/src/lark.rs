//! Lark (Feishu) channel.
//!
//! Outbound: text messages through the Open API, authenticated with a
//! tenant access token that is cached until five minutes before it expires.
//! Inbound: [`parse_event`] turns an event callback body into a
//! [`LarkInbound`] for the gateway's webhook route.

use async_trait::async_trait;
use relayclaw_core::channel::Channel;
use relayclaw_core::error::ChannelError;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const HEADER_TIMESTAMP: &str = "X-Lark-Request-Timestamp";
pub const HEADER_NONCE: &str = "X-Lark-Request-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Lark-Signature";

#[derive(Debug, Clone)]
pub struct LarkConfig {
    pub app_id: String,
    pub app_secret: String,
    /// Open API root, e.g. `https://open.feishu.cn/open-apis`.
    pub base_url: String,
}

impl From<&relayclaw_config::LarkConfig> for LarkConfig {
    fn from(cfg: &relayclaw_config::LarkConfig) -> Self {
        Self {
            app_id: cfg.app_id.clone(),
            app_secret: cfg.app_secret.clone().unwrap_or_default(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        }
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    /// Seconds until expiry.
    #[serde(default)]
    expire: u64,
}

#[derive(Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

pub struct LarkChannel {
    config: LarkConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl LarkChannel {
    pub fn new(config: LarkConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    fn failed(reason: impl Into<String>) -> ChannelError {
        ChannelError::DeliveryFailed {
            channel: "lark".into(),
            reason: reason.into(),
        }
    }

    /// A valid tenant access token, fetched when the cached one is missing
    /// or within the refresh margin.
    pub async fn tenant_token(&self) -> Result<String, ChannelError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        if self.config.app_id.is_empty() || self.config.app_secret.is_empty() {
            return Err(ChannelError::NotConfigured(
                "lark app_id and app_secret are required".into(),
            ));
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.config.base_url);
        debug!(url = %url, "Fetching Lark tenant access token");
        let response: TokenResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?
            .json()
            .await
            .map_err(|e| Self::failed(format!("invalid token response: {e}")))?;

        if response.code != 0 || response.tenant_access_token.is_empty() {
            return Err(ChannelError::AuthenticationFailed(format!(
                "lark token request failed ({}): {}",
                response.code, response.msg
            )));
        }

        let lifetime = Duration::from_secs(response.expire).saturating_sub(TOKEN_REFRESH_MARGIN);
        let value = response.tenant_access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        info!(expires_in = response.expire, "Lark tenant token refreshed");
        Ok(value)
    }

    /// Send a text message. `receive_id_type` is `open_id` or `chat_id`.
    pub async fn send_text(
        &self,
        receive_id_type: &str,
        receive_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let token = self.tenant_token().await?;
        let url = format!(
            "{}/im/v1/messages?receive_id_type={receive_id_type}",
            self.config.base_url
        );
        let content = serde_json::json!({ "text": text }).to_string();

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({
                "receive_id": receive_id,
                "msg_type": "text",
                "content": content,
            }))
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| Self::failed(format!("HTTP {status}: {e}")))?;
        if body.code != 0 {
            warn!(code = body.code, msg = %body.msg, "Lark rejected message");
            return Err(Self::failed(format!("lark error {}: {}", body.code, body.msg)));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for LarkChannel {
    fn name(&self) -> &str {
        "lark"
    }

    async fn reply(
        &self,
        correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> Result<bool, ChannelError> {
        // Group chats are addressed by chat id, everything else by the sender's open id.
        match correlation_id.filter(|id| id.starts_with("oc_")) {
            Some(chat_id) => self.send_text("chat_id", chat_id, text).await?,
            None => self.send_text("open_id", peer_id, text).await?,
        }
        Ok(true)
    }

    async fn health_check(&self) -> Result<bool, ChannelError> {
        Ok(self.tenant_token().await.is_ok())
    }
}

/// What an inbound event callback asks the gateway to do.
#[derive(Debug, Clone, PartialEq)]
pub enum LarkInbound {
    /// Endpoint verification handshake; echo the challenge.
    UrlVerification { challenge: String },
    /// A text message to enqueue.
    Message(LarkMessage),
    /// A message we do not handle (images, files, ...).
    Ignored { event_id: String, message_type: String },
    /// Some other event type.
    Unhandled { event_id: String, event_type: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LarkMessage {
    pub event_id: String,
    /// Sender open id, or `"unknown"`.
    pub peer_id: String,
    pub chat_id: Option<String>,
    pub message_type: String,
    pub text: String,
}

impl LarkInbound {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::UrlVerification { .. } => None,
            Self::Message(m) => Some(m.event_id.as_str()),
            Self::Ignored { event_id, .. } | Self::Unhandled { event_id, .. } => {
                Some(event_id.as_str())
            }
        }
    }
}

/// Parse an event callback body (schema 2.0).
pub fn parse_event(body: &Value) -> Result<LarkInbound, ChannelError> {
    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = body
            .get("challenge")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(LarkInbound::UrlVerification { challenge });
    }

    let header = body.get("header");
    let event_id = header
        .and_then(|h| h.get("event_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChannelError::InvalidPayload("missing header.event_id".into()))?
        .to_string();
    let event_type = header
        .and_then(|h| h.get("event_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if event_type != "im.message.receive_v1" {
        return Ok(LarkInbound::Unhandled { event_id, event_type });
    }

    let event = body.get("event");
    let message = event
        .and_then(|e| e.get("message"))
        .ok_or_else(|| ChannelError::InvalidPayload("missing event.message".into()))?;
    let sender = event
        .and_then(|e| e.get("sender"))
        .ok_or_else(|| ChannelError::InvalidPayload("missing event.sender".into()))?;

    let message_type = message
        .get("message_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if message_type != "text" {
        return Ok(LarkInbound::Ignored { event_id, message_type });
    }

    let raw = message.get("content").and_then(Value::as_str).unwrap_or_default();
    let text = serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("text").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| raw.to_string());

    let peer_id = sender
        .get("sender_id")
        .and_then(|s| s.get("open_id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let chat_id = message.get("chat_id").and_then(Value::as_str).map(String::from);

    Ok(LarkInbound::Message(LarkMessage {
        event_id,
        peer_id,
        chat_id,
        message_type,
        text,
    }))
}
