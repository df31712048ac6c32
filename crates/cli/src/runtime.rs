//! Build the running components from configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relayclaw_agent::ConversationLoop;
use relayclaw_channels::{ChannelRegistry, WebChatChannel, registry_from_config};
use relayclaw_config::AppConfig;
use relayclaw_core::job::JobQueue;
use relayclaw_core::provider::Provider;
use relayclaw_core::session::SessionStore;
use relayclaw_core::tool::ToolRegistry;
use relayclaw_dispatch::{DispatchMode, Worker, queue_from_config};
use relayclaw_gateway::GatewayState;
use relayclaw_security::AuditLogger;
use relayclaw_sessions::{InMemorySessionStore, SqliteSessionStore};
use relayclaw_tools::SkillLoader;
use tokio::task::JoinHandle;
use tracing::info;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often the skills directory is rescanned.
pub const SKILL_RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Every long-lived component, built once per process.
pub struct Runtime {
    pub config: AppConfig,
    pub conversation: ConversationLoop,
    pub queue: Arc<dyn JobQueue>,
    pub channels: Arc<ChannelRegistry>,
    pub webchat: Option<Arc<WebChatChannel>>,
    pub audit: Arc<AuditLogger>,
    pub mode: DispatchMode,
    skills: Option<Arc<SkillLoader>>,
}

impl Runtime {
    /// Build with the provider the config selects.
    pub async fn from_config(config: AppConfig) -> Result<Self, BoxError> {
        let provider = relayclaw_providers::router::build_from_config(&config)?;
        Self::with_provider(config, provider).await
    }

    /// Build around an explicit provider.
    pub async fn with_provider(config: AppConfig, provider: Arc<dyn Provider>) -> Result<Self, BoxError> {
        let mode: DispatchMode = config.dispatch.mode.parse()?;

        let tools = Arc::new(relayclaw_tools::default_registry());
        let skills = config.skills.dir.as_deref().map(|dir| {
            let loader = Arc::new(SkillLoader::new(dir));
            let report = loader.rescan(&tools);
            info!(dir = %dir, skills = report.added.len(), "Skills loaded");
            loader
        });

        let sessions = build_sessions(&config).await?;
        let conversation = ConversationLoop::new(provider, tools, sessions).with_config(&config.agent);

        let queue = queue_from_config(&config.dispatch).await?;
        let (channels, webchat) = registry_from_config(&config.channels);
        let audit = Arc::new(AuditLogger::from_dir(config.audit.path.as_deref().map(Path::new)));

        info!(
            mode = ?mode,
            queue = %config.dispatch.queue,
            storage = %config.storage.backend,
            channels = ?channels.list(),
            "Runtime ready"
        );

        Ok(Self {
            config,
            conversation,
            queue,
            channels: Arc::new(channels),
            webchat,
            audit,
            mode,
            skills,
        })
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.conversation.tools()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        self.conversation.sessions()
    }

    /// Keep skills in sync with their directory. `None` when no directory is configured.
    pub fn spawn_skill_reload(&self) -> Option<JoinHandle<()>> {
        let loader = self.skills.clone()?;
        Some(loader.hot_reload(self.tools().clone(), SKILL_RESCAN_INTERVAL))
    }

    /// Gateway state sharing this runtime's components.
    pub fn gateway_state(&self) -> GatewayState {
        let channels = &self.config.channels;
        GatewayState::new(self.conversation.clone())
            .with_queue(self.queue.clone())
            .with_channels(self.channels.clone(), self.webchat.clone())
            .with_audit(self.audit.clone())
            .with_mode(self.mode)
            .with_auth_token(self.config.gateway.auth_token.clone())
            .with_webhook_secret(channels.webhook.shared_secret.clone())
            .with_lark_encrypt_key(channels.lark.encrypt_key.clone())
    }

    /// A queue worker sharing this runtime's components.
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.conversation.clone(),
            self.channels.clone(),
            self.audit.clone(),
        )
        .with_concurrency(self.config.dispatch.worker_concurrency)
    }
}

async fn build_sessions(config: &AppConfig) -> Result<Arc<dyn SessionStore>, BoxError> {
    let max = config.agent.max_history_messages;
    match config.storage.backend.as_str() {
        "sqlite" => {
            let path = &config.storage.db_path;
            let url = if path.starts_with("sqlite:") {
                path.clone()
            } else {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                format!("sqlite://{path}")
            };
            Ok(Arc::new(SqliteSessionStore::new(&url, max).await?))
        }
        _ => Ok(Arc::new(InMemorySessionStore::new(max))),
    }
}
