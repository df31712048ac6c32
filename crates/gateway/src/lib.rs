//! HTTP gateway for RelayClaw.
//!
//! Exposes the conversation loop over REST, SSE and WebSocket, and accepts
//! platform webhooks that are answered through the job queue.
//!
//! Built on Axum.

pub mod api_v1;
pub mod idempotency;
pub mod webhook;
pub mod ws;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relayclaw_agent::ConversationLoop;
use relayclaw_channels::{ChannelRegistry, WebChatChannel};
use relayclaw_core::job::JobQueue;
use relayclaw_core::session::SessionStore;
use relayclaw_dispatch::{DispatchMode, InProcessQueue};
use relayclaw_security::AuditLogger;

pub use idempotency::IdempotencyStore;

/// Everything the handlers need. Built once and shared.
pub struct GatewayState {
    pub conversation: ConversationLoop,
    pub queue: Arc<dyn JobQueue>,
    pub channels: Arc<ChannelRegistry>,
    /// Present when the WebChat channel is enabled.
    pub webchat: Option<Arc<WebChatChannel>>,
    pub audit: Arc<AuditLogger>,
    pub idempotency: Arc<IdempotencyStore>,
    pub mode: DispatchMode,
    /// Bearer token for `/v1/*`. `None` disables auth.
    pub auth_token: Option<String>,
    /// HMAC key for `POST /v1/webhook/webhook`.
    pub webhook_secret: Option<String>,
    /// Lark event signature key.
    pub lark_encrypt_key: Option<String>,
    pub started_at: Instant,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Minimal state: inline mode, in-process queue, no channels, no auth.
    pub fn new(conversation: ConversationLoop) -> Self {
        Self {
            conversation,
            queue: Arc::new(InProcessQueue::default()),
            channels: Arc::new(ChannelRegistry::new()),
            webchat: None,
            audit: Arc::new(AuditLogger::in_memory()),
            idempotency: Arc::new(IdempotencyStore::default()),
            mode: DispatchMode::Inline,
            auth_token: None,
            webhook_secret: None,
            lark_encrypt_key: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_channels(mut self, channels: Arc<ChannelRegistry>, webchat: Option<Arc<WebChatChannel>>) -> Self {
        self.channels = channels;
        self.webchat = webchat;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Empty tokens count as unset.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_lark_encrypt_key(mut self, key: Option<String>) -> Self {
        self.lark_encrypt_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.conversation.sessions()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// JSON error body used by every route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

/// Build the full router.
///
/// - `GET /health` is open
/// - `/v1/*` requires the bearer token when one is configured
/// - `POST /v1/webhook/{channel}` authenticates per channel instead
pub fn build_router(state: SharedState) -> Router {
    let v1 = api_v1::v1_router(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/webhook/{channel}", post(webhook::webhook_handler))
        .with_state(state)
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve until the listener fails or `shutdown` resolves.
pub async fn serve(
    state: SharedState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let cleanup = state
        .idempotency
        .clone()
        .spawn_cleanup(idempotency::CLEANUP_INTERVAL);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    cleanup.abort();
    result
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    timestamp: String,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    })
}

/// Bearer auth for `/v1`.
///
/// Browsers cannot set headers on a WebSocket handshake, so `?token=` is
/// accepted as well.
async fn auth_middleware(
    State(state): State<SharedState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let from_query = req.uri().query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v)
    });

    if from_header == Some(expected) || from_query == Some(expected) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "Unauthorized request to /v1");
        error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use relayclaw_agent::testing::ScriptedProvider;
    use relayclaw_sessions::InMemorySessionStore;

    pub fn state_with(provider: ScriptedProvider) -> GatewayState {
        let conversation = ConversationLoop::new(
            Arc::new(provider),
            Arc::new(relayclaw_tools::default_registry()),
            Arc::new(InMemorySessionStore::default()),
        );
        GatewayState::new(conversation)
    }

    pub fn shared(provider: ScriptedProvider) -> SharedState {
        Arc::new(state_with(provider))
    }
}
