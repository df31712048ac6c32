//! Configuration loading, validation, and management for RelayClaw.
//!
//! Loads configuration from `~/.relayclaw/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.relayclaw/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub skills: SkillsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on `/v1/*` (webhooks excepted). Open when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    18789
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth_token", &redact(&self.auth_token))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// "openai", "anthropic" or "responses"
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Transcript window per session.
    #[serde(default = "default_max_history")]
    pub max_history_messages: usize,

    /// Upper bound on model rounds per inbound message.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Run the reflection post-processor after each conversation.
    #[serde(default = "default_true")]
    pub reflection: bool,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_system_prompt() -> String {
    "You are RelayClaw, a helpful personal AI assistant. Be concise, accurate, and friendly.".into()
}
fn default_max_history() -> usize {
    50
}
fn default_max_tool_rounds() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            system_prompt: default_system_prompt(),
            max_history_messages: default_max_history(),
            max_tool_rounds: default_max_tool_rounds(),
            reflection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderConfig::openai")]
    pub openai: ProviderConfig,

    #[serde(default = "ProviderConfig::anthropic")]
    pub anthropic: ProviderConfig,

    #[serde(default = "ProviderConfig::responses")]
    pub responses: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderConfig::openai(),
            anthropic: ProviderConfig::anthropic(),
            responses: ProviderConfig::responses(),
        }
    }
}

/// One provider's settings. Blank `base_url`/`model` fall back to the
/// adapter's built-in defaults when the provider is built.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub model: String,

    /// Redirect hops the buffered Responses adapter follows.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

fn default_max_redirects() -> usize {
    3
}

impl ProviderConfig {
    fn openai() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            max_redirects: default_max_redirects(),
        }
    }

    fn anthropic() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".into(),
            model: "claude-sonnet-4-20250514".into(),
            max_redirects: default_max_redirects(),
        }
    }

    fn responses() -> Self {
        Self {
            api_key: None,
            base_url: String::new(),
            model: String::new(),
            max_redirects: default_max_redirects(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_redirects", &self.max_redirects)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebchatConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub lark: LarkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebchatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebchatConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Where replies are POSTed.
    #[serde(default)]
    pub callback_url: String,

    /// HMAC-SHA256 key for the `X-Signature` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("enabled", &self.enabled)
            .field("callback_url", &self.callback_url)
            .field("shared_secret", &redact(&self.shared_secret))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LarkConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub app_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,

    #[serde(default = "default_lark_base_url")]
    pub base_url: String,

    /// Verifies `X-Lark-Signature` on inbound events when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key: Option<String>,
}

fn default_lark_base_url() -> String {
    "https://open.feishu.cn/open-apis".into()
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            app_secret: None,
            base_url: default_lark_base_url(),
            encrypt_key: None,
        }
    }
}

impl std::fmt::Debug for LarkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LarkConfig")
            .field("enabled", &self.enabled)
            .field("app_id", &self.app_id)
            .field("app_secret", &redact(&self.app_secret))
            .field("base_url", &self.base_url)
            .field("encrypt_key", &redact(&self.encrypt_key))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// "inline" answers on the request; "queued" hands work to workers.
    #[serde(default = "default_dispatch_mode")]
    pub mode: String,

    /// "memory" (single process) or "sqlite" (shared between processes).
    #[serde(default = "default_queue_backend")]
    pub queue: String,

    #[serde(default = "default_queue_path")]
    pub queue_path: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often an idle SQLite worker polls for new jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_dispatch_mode() -> String {
    "inline".into()
}
fn default_queue_backend() -> String {
    "memory".into()
}
fn default_queue_path() -> String {
    "./data/queue.db".into()
}
fn default_worker_concurrency() -> usize {
    1
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            queue: default_queue_backend(),
            queue_path: default_queue_path(),
            worker_concurrency: default_worker_concurrency(),
            queue_capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_storage_backend() -> String {
    "memory".into()
}
fn default_db_path() -> String {
    "./data/relayclaw.db".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSONL file that receives one line per audit entry. Log-only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directory scanned for `*.skill.toml` manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "responses"];

impl AppConfig {
    /// Load configuration from `RELAYCLAW_CONFIG` or the default path,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RELAYCLAW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        Self::load_with_env(&path)
    }

    /// Load from `path`, apply environment overrides, validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("GATEWAY_PORT") {
            match port.parse() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid GATEWAY_PORT"),
            }
        }
        if let Some(host) = lookup("GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(token) = lookup("GATEWAY_AUTH_TOKEN") {
            self.gateway.auth_token = Some(token);
        }

        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.providers.openai.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.providers.openai.model = model;
        }

        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.providers.anthropic.api_key = Some(key);
        }
        if let Some(model) = lookup("ANTHROPIC_MODEL") {
            self.providers.anthropic.model = model;
        }

        if let Some(key) = lookup("RESPONSES_API_KEY") {
            self.providers.responses.api_key = Some(key);
        }
        if let Some(url) = lookup("RESPONSES_BASE_URL") {
            self.providers.responses.base_url = url;
        }
        if let Some(model) = lookup("RESPONSES_MODEL") {
            self.providers.responses.model = model;
        }

        if let Some(provider) = lookup("DEFAULT_PROVIDER") {
            self.agent.default_provider = provider;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".relayclaw")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_PROVIDERS.contains(&self.agent.default_provider.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "agent.default_provider must be one of {:?}, got '{}'",
                KNOWN_PROVIDERS, self.agent.default_provider
            )));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::ValidationError("agent.max_tool_rounds must be > 0".into()));
        }
        if self.agent.max_history_messages == 0 {
            return Err(ConfigError::ValidationError("agent.max_history_messages must be > 0".into()));
        }
        if !matches!(self.dispatch.mode.as_str(), "inline" | "queued") {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.mode must be 'inline' or 'queued', got '{}'",
                self.dispatch.mode
            )));
        }
        if !matches!(self.dispatch.queue.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.queue must be 'memory' or 'sqlite', got '{}'",
                self.dispatch.queue
            )));
        }
        if self.dispatch.worker_concurrency == 0 || self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.worker_concurrency and dispatch.queue_capacity must be > 0".into(),
            ));
        }
        if !matches!(self.storage.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "storage.backend must be 'memory' or 'sqlite', got '{}'",
                self.storage.backend
            )));
        }
        if self.channels.webhook.enabled && self.channels.webhook.callback_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "channels.webhook.callback_url is required when the webhook channel is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.agent.max_tool_rounds, 10);
        assert_eq!(config.agent.max_history_messages, 50);
        assert_eq!(config.providers.openai.model, "gpt-4o");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.agent.default_provider, config.agent.default_provider);
        assert_eq!(parsed.gateway.port, config.gateway.port);
    }

    #[test]
    fn partial_section_leaves_blank_fields() {
        let parsed: AppConfig = toml::from_str(
            r#"
[providers.anthropic]
api_key = "sk-ant"
"#,
        )
        .unwrap();
        assert_eq!(parsed.providers.anthropic.model, "");
        assert_eq!(parsed.providers.openai.model, "gpt-4o");
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = AppConfig::default();
        config.agent.default_provider = "mystery".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rounds_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_tool_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_dispatch_mode_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.mode = "carrier-pigeon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("GATEWAY_PORT", "9000"),
            ("OPENAI_API_KEY", "sk-env"),
            ("DEFAULT_PROVIDER", "anthropic"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.providers.openai.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.agent.default_provider, "anthropic");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn invalid_port_override_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_overrides(|k| (k == "GATEWAY_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.gateway.port, 18789);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.providers.openai.api_key = Some("sk-secret".into());
        config.gateway.auth_token = Some("tok".into());
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(!dbg.contains("\"tok\""));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.agent.default_provider, "openai");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
port = 4000

[agent]
max_tool_rounds = 2
"#,
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 4000);
        assert_eq!(config.agent.max_tool_rounds, 2);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway\nport = ").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("18789"));
        assert!(toml_str.contains("gpt-4o"));
    }
}
