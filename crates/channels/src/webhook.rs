//! Webhook channel: POSTs replies to a callback URL.
//!
//! Body: `{"peerId", "correlationId", "text"}`. With a shared secret the
//! body is signed and the digest sent as `X-Signature: sha256=<hex>`.

use async_trait::async_trait;
use relayclaw_core::channel::Channel;
use relayclaw_core::error::ChannelError;
use relayclaw_security::signature::{self, SIGNATURE_HEADER};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// Where replies go. Empty = replies are dropped.
    pub callback_url: String,
    /// HMAC key for signing. `None` or empty = unsigned.
    pub shared_secret: Option<String>,
}

impl From<&relayclaw_config::WebhookConfig> for WebhookConfig {
    fn from(cfg: &relayclaw_config::WebhookConfig) -> Self {
        Self {
            callback_url: cfg.callback_url.clone(),
            shared_secret: cfg.shared_secret.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallbackBody<'a> {
    peer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    text: &'a str,
}

pub struct WebhookChannel {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn failed(&self, reason: impl Into<String>) -> ChannelError {
        ChannelError::DeliveryFailed {
            channel: "webhook".into(),
            reason: reason.into(),
        }
    }

    /// Check an inbound body against the shared secret.
    pub fn validate_signature(&self, payload: &[u8], signature: &str) -> bool {
        match &self.config.shared_secret {
            Some(secret) => signature::verify(secret, payload, signature),
            None => true,
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn reply(
        &self,
        correlation_id: Option<&str>,
        peer_id: &str,
        text: &str,
    ) -> Result<bool, ChannelError> {
        if self.config.callback_url.is_empty() {
            info!(peer = %peer_id, "Webhook: no callback URL configured, reply discarded");
            return Ok(false);
        }

        let body = serde_json::to_vec(&CallbackBody {
            peer_id,
            correlation_id,
            text,
        })
        .map_err(|e| self.failed(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.config.callback_url)
            .header("Content-Type", "application/json");
        if let Some(secret) = self.config.shared_secret.as_deref().filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, signature::sign(secret, &body));
        }

        debug!(url = %self.config.callback_url, peer = %peer_id, "Posting webhook reply");
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Webhook callback rejected reply");
            return Err(self.failed(format!("callback returned {status}: {body}")));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn channel_name() {
        let ch = WebhookChannel::new(WebhookConfig::default());
        assert_eq!(ch.name(), "webhook");
    }

    #[tokio::test]
    async fn no_callback_means_not_delivered() {
        let ch = WebhookChannel::new(WebhookConfig::default());
        assert!(!ch.reply(None, "p", "x").await.unwrap());
    }

    #[tokio::test]
    async fn posts_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Signature"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ch = WebhookChannel::new(WebhookConfig {
            callback_url: format!("{}/hook", server.uri()),
            shared_secret: Some("s3cret".into()),
        });
        assert!(ch.reply(Some("corr-1"), "peer-1", "answer").await.unwrap());

        let requests = server.received_requests().await.unwrap();
        let req = &requests[0];
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["peerId"], "peer-1");
        assert_eq!(body["correlationId"], "corr-1");
        assert_eq!(body["text"], "answer");

        let sig = req.headers.get("X-Signature").unwrap().to_str().unwrap();
        assert!(signature::verify("s3cret", &req.body, sig));
    }

    #[tokio::test]
    async fn non_success_is_delivery_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let ch = WebhookChannel::new(WebhookConfig {
            callback_url: server.uri(),
            shared_secret: None,
        });
        let err = ch.reply(None, "p", "x").await.unwrap_err();
        assert!(matches!(err, ChannelError::DeliveryFailed { ref reason, .. } if reason.contains("503")));
    }

    #[test]
    fn validates_inbound_signatures() {
        let ch = WebhookChannel::new(WebhookConfig {
            callback_url: String::new(),
            shared_secret: Some("k".into()),
        });
        let sig = signature::sign("k", b"body");
        assert!(ch.validate_signature(b"body", &sig));
        assert!(!ch.validate_signature(b"other", &sig));

        let open = WebhookChannel::new(WebhookConfig::default());
        assert!(open.validate_signature(b"anything", "any"));
    }
}
