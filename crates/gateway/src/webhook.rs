//! Inbound platform webhooks.
//!
//! `POST /v1/webhook/{channel}` authenticates per channel, drops events
//! already seen, and queues the message. The worker answers through the
//! same channel later, so the platform gets an immediate acknowledgement.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use relayclaw_channels::lark::{self, LarkInbound, LarkMessage};
use relayclaw_core::error::ChannelError;
use relayclaw_core::job::{Job, Priority};
use relayclaw_dispatch::submit;
use relayclaw_security::signature;

use crate::{SharedState, error_response};

pub async fn webhook_handler(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match channel.as_str() {
        "lark" => lark_webhook(&state, &headers, &body).await,
        "webhook" => generic_webhook(&state, &headers, &body).await,
        other => {
            debug!(channel = %other, "Webhook for unknown channel");
            error_response(StatusCode::NOT_FOUND, format!("Unknown webhook channel '{other}'"))
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ── Lark ──────────────────────────────────────────────────────────────────

async fn lark_webhook(state: &SharedState, headers: &HeaderMap, body: &[u8]) -> Response {
    if let Some(key) = state.lark_encrypt_key.as_deref() {
        let (Some(ts), Some(nonce), Some(sig)) = (
            header(headers, lark::HEADER_TIMESTAMP),
            header(headers, lark::HEADER_NONCE),
            header(headers, lark::HEADER_SIGNATURE),
        ) else {
            warn!("Lark webhook without signature headers");
            return error_response(StatusCode::UNAUTHORIZED, "Missing signature");
        };
        if !signature::verify_lark(ts, nonce, key, body, sig) {
            warn!("Lark webhook signature mismatch");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    }

    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}")),
    };
    let inbound = match lark::parse_event(&payload) {
        Ok(inbound) => inbound,
        Err(ChannelError::InvalidPayload(reason)) => {
            return error_response(StatusCode::BAD_REQUEST, reason);
        }
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let dedup_key = inbound.event_id().map(|id| format!("lark:{id}"));
    if let Some(key) = &dedup_key {
        if state.idempotency.is_duplicate(key) {
            info!(key = %key, "Duplicate Lark event skipped");
            return Json(json!({ "message": "Event already processed" })).into_response();
        }
    }

    match inbound {
        LarkInbound::UrlVerification { challenge } => {
            info!("Lark URL verification");
            Json(json!({ "challenge": challenge })).into_response()
        }
        LarkInbound::Ignored { event_id, message_type } => {
            debug!(event_id = %event_id, message_type = %message_type, "Non-text Lark message ignored");
            Json(json!({ "message": format!("Message type '{message_type}' ignored") })).into_response()
        }
        LarkInbound::Unhandled { event_id, event_type } => {
            debug!(event_id = %event_id, event_type = %event_type, "Lark event not handled");
            Json(json!({ "message": "Event type not handled" })).into_response()
        }
        LarkInbound::Message(message) => enqueue_lark_message(state, message, dedup_key.as_deref()).await,
    }
}

async fn enqueue_lark_message(state: &SharedState, message: LarkMessage, dedup_key: Option<&str>) -> Response {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let task_id = format!("lark-{}-{}", message.event_id, &suffix[..6]);
    let detail = json!({
        "eventId": message.event_id,
        "messageType": message.message_type,
        "textLength": message.text.chars().count(),
    });

    let mut job = Job::new("lark", message.peer_id, message.text)
        .with_task_id(task_id)
        .with_priority(Priority::High);
    if let Some(chat_id) = message.chat_id {
        job = job.with_correlation_id(chat_id);
    }

    match submit(state.queue.as_ref(), &state.audit, job, Some(detail)).await {
        Ok(receipt) => Json(json!({
            "message": "Event received",
            "taskId": receipt.task_id,
            "jobId": receipt.job_id,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to queue Lark message");
            if let Some(key) = dedup_key {
                state.idempotency.forget(key);
            }
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ── Generic webhook ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEvent {
    #[serde(default)]
    event_id: Option<String>,
    peer_id: String,
    #[serde(default, alias = "message")]
    text: String,
    #[serde(default)]
    correlation_id: Option<String>,
}

async fn generic_webhook(state: &SharedState, headers: &HeaderMap, body: &[u8]) -> Response {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let Some(sig) = header(headers, signature::SIGNATURE_HEADER) else {
            return error_response(StatusCode::UNAUTHORIZED, "Missing signature");
        };
        if !signature::verify(secret, body, sig) {
            warn!("Webhook signature mismatch");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    }

    let event: WebhookEvent = match serde_json::from_slice(body) {
        Ok(e) => e,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid payload: {e}")),
    };
    if event.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "'text' must not be empty");
    }

    let dedup_key = event
        .event_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(|id| format!("webhook:{id}"));
    if let Some(key) = &dedup_key {
        if state.idempotency.is_duplicate(key) {
            info!(key = %key, "Duplicate webhook event skipped");
            return Json(json!({ "message": "Event already processed" })).into_response();
        }
    }

    let detail = json!({
        "eventId": event.event_id,
        "textLength": event.text.chars().count(),
    });
    let mut job = Job::new("webhook", event.peer_id, event.text);
    if let Some(correlation_id) = event.correlation_id {
        job = job.with_correlation_id(correlation_id);
    }

    match submit(state.queue.as_ref(), &state.audit, job, Some(detail)).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "Event received",
                "taskId": receipt.task_id,
                "jobId": receipt.job_id,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to queue webhook message");
            if let Some(key) = &dedup_key {
                state.idempotency.forget(key);
            }
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{shared, state_with};
    use crate::{SharedState, build_router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use relayclaw_agent::testing::ScriptedProvider;
    use relayclaw_core::job::Priority;
    use relayclaw_dispatch::InProcessQueue;
    use relayclaw_security::{AuditAction, signature};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn lark_message(event_id: &str, text: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": {"event_id": event_id, "event_type": "im.message.receive_v1"},
            "event": {
                "sender": {"sender_id": {"open_id": "ou_alice"}},
                "message": {
                    "chat_id": "oc_chat",
                    "message_type": "text",
                    "content": json!({"text": text}).to_string()
                }
            }
        })
    }

    fn post(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
    }

    async fn send(state: &SharedState, req: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn lark_request(body: &Value) -> Request<Body> {
        let raw = body.to_string();
        post("/v1/webhook/lark").body(Body::from(raw)).unwrap()
    }

    #[tokio::test]
    async fn lark_url_verification_echoes_challenge() {
        let state = shared(ScriptedProvider::text("x"));
        let (status, json) = send(
            &state,
            lark_request(&json!({"type": "url_verification", "challenge": "abc123"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["challenge"], "abc123");
    }

    #[tokio::test]
    async fn lark_message_is_queued_once() {
        let state = shared(ScriptedProvider::text("x"));
        let body = lark_message("evt-1", "hello bot");

        let (status, json) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Event received");
        let task_id = json["taskId"].as_str().unwrap().to_string();
        assert!(task_id.starts_with("lark-evt-1-"));
        assert_eq!(task_id.len(), "lark-evt-1-".len() + 6);

        let (status, json) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Event already processed");

        let stats = state.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);

        let queued = state.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queued.job.channel, "lark");
        assert_eq!(queued.job.peer_id, "ou_alice");
        assert_eq!(queued.job.content, "hello bot");
        assert_eq!(queued.job.correlation_id.as_deref(), Some("oc_chat"));
        assert_eq!(queued.job.priority, Priority::High);

        let entries = state.audit.entries_for(&task_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::MessageReceived);
        let detail = entries[0].detail.as_ref().unwrap();
        assert_eq!(detail["eventId"], "evt-1");
        assert_eq!(detail["messageType"], "text");
        assert_eq!(detail["textLength"], 9);
    }

    #[tokio::test]
    async fn lark_non_text_message_is_ignored() {
        let state = shared(ScriptedProvider::text("x"));
        let mut body = lark_message("evt-img", "");
        body["event"]["message"]["message_type"] = json!("image");

        let (status, json) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["message"].as_str().unwrap().contains("ignored"));
        assert_eq!(state.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn lark_other_event_is_not_handled() {
        let state = shared(ScriptedProvider::text("x"));
        let body = json!({"header": {"event_id": "evt-2", "event_type": "contact.user.created_v3"}});
        let (status, json) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Event type not handled");
    }

    #[tokio::test]
    async fn lark_malformed_event_is_bad_request() {
        let state = shared(ScriptedProvider::text("x"));
        let (status, _) = send(&state, lark_request(&json!({"header": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = post("/v1/webhook/lark")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lark_signature_is_enforced_when_key_set() {
        let state = Arc::new(
            state_with(ScriptedProvider::text("x")).with_lark_encrypt_key(Some("enc-key".into())),
        );
        let raw = lark_message("evt-s", "hi").to_string();

        let (status, json) = send(&state, lark_request(&serde_json::from_str(&raw).unwrap())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Missing signature");

        let req = post("/v1/webhook/lark")
            .header("X-Lark-Request-Timestamp", "1700000000")
            .header("X-Lark-Request-Nonce", "n1")
            .header("X-Lark-Signature", "deadbeef")
            .body(Body::from(raw.clone()))
            .unwrap();
        let (status, json) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid signature");

        let sig = signature::lark_signature("1700000000", "n1", "enc-key", raw.as_bytes());
        let req = post("/v1/webhook/lark")
            .header("X-Lark-Request-Timestamp", "1700000000")
            .header("X-Lark-Request-Nonce", "n1")
            .header("X-Lark-Signature", sig)
            .body(Body::from(raw))
            .unwrap();
        let (status, json) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Event received");
    }

    #[tokio::test]
    async fn generic_webhook_queues_and_dedups() {
        let state = shared(ScriptedProvider::text("x"));
        let raw = json!({
            "eventId": "e-1",
            "peerId": "user-7",
            "message": "status please",
            "correlationId": "thread-9"
        })
        .to_string();

        let req = post("/v1/webhook/webhook").body(Body::from(raw.clone())).unwrap();
        let (status, json) = send(&state, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["taskId"].as_str().unwrap().starts_with("webhook-"));

        let req = post("/v1/webhook/webhook").body(Body::from(raw)).unwrap();
        let (status, json) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Event already processed");

        let queued = state.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queued.job.peer_id, "user-7");
        assert_eq!(queued.job.content, "status please");
        assert_eq!(queued.job.correlation_id.as_deref(), Some("thread-9"));
    }

    #[tokio::test]
    async fn failed_enqueue_lets_redelivery_through() {
        let closed = Arc::new(InProcessQueue::new(4));
        closed.close();
        let state = Arc::new(state_with(ScriptedProvider::text("x")).with_queue(closed));
        let raw = json!({"eventId": "e-9", "peerId": "u", "text": "hi"}).to_string();

        let req = post("/v1/webhook/webhook").body(Body::from(raw.clone())).unwrap();
        let (status, _) = send(&state, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let req = post("/v1/webhook/webhook").body(Body::from(raw)).unwrap();
        let (status, json) = send(&state, req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_ne!(json["message"], "Event already processed");
        assert!(!state.idempotency.is_duplicate("webhook:e-9"));
    }

    #[tokio::test]
    async fn failed_lark_enqueue_lets_redelivery_through() {
        let closed = Arc::new(InProcessQueue::new(4));
        closed.close();
        let state = Arc::new(state_with(ScriptedProvider::text("x")).with_queue(closed));
        let body = lark_message("evt-503", "hello");

        let (status, _) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&state, lark_request(&body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn generic_webhook_checks_hmac() {
        let state = Arc::new(
            state_with(ScriptedProvider::text("x")).with_webhook_secret(Some("hook-secret".into())),
        );
        let raw = json!({"peerId": "u", "text": "hi"}).to_string();

        let req = post("/v1/webhook/webhook").body(Body::from(raw.clone())).unwrap();
        assert_eq!(send(&state, req).await.0, StatusCode::UNAUTHORIZED);

        let req = post("/v1/webhook/webhook")
            .header("X-Signature", signature::sign("wrong", raw.as_bytes()))
            .body(Body::from(raw.clone()))
            .unwrap();
        assert_eq!(send(&state, req).await.0, StatusCode::UNAUTHORIZED);

        let req = post("/v1/webhook/webhook")
            .header("X-Signature", signature::sign("hook-secret", raw.as_bytes()))
            .body(Body::from(raw))
            .unwrap();
        assert_eq!(send(&state, req).await.0, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn generic_webhook_rejects_empty_text() {
        let state = shared(ScriptedProvider::text("x"));
        let raw = json!({"peerId": "u", "text": " "}).to_string();
        let req = post("/v1/webhook/webhook").body(Body::from(raw)).unwrap();
        assert_eq!(send(&state, req).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let state = shared(ScriptedProvider::text("x"));
        let req = post("/v1/webhook/telegram")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(send(&state, req).await.0, StatusCode::NOT_FOUND);
    }
}
