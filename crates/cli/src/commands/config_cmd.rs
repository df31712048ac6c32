//! `relayclaw config`: Configuration management commands.

use std::path::Path;

use relayclaw::runtime::BoxError;
use relayclaw_config::AppConfig;

const REDACTED: &str = "***";

fn redact(secret: &mut Option<String>) {
    if secret.as_deref().is_some_and(|s| !s.is_empty()) {
        *secret = Some(REDACTED.into());
    }
}

/// The config as TOML with every secret masked.
pub fn redacted_toml(config: &AppConfig) -> Result<String, BoxError> {
    let mut config = config.clone();
    redact(&mut config.gateway.auth_token);
    redact(&mut config.providers.openai.api_key);
    redact(&mut config.providers.anthropic.api_key);
    redact(&mut config.providers.responses.api_key);
    redact(&mut config.channels.webhook.shared_secret);
    redact(&mut config.channels.lark.app_secret);
    redact(&mut config.channels.lark.encrypt_key);
    Ok(toml::to_string_pretty(&config)?)
}

pub fn show(config: &AppConfig, path: &Path) -> Result<(), BoxError> {
    println!("# {}", path.display());
    if !path.exists() {
        println!("# (file not found; showing defaults plus environment overrides)");
    }
    println!("{}", redacted_toml(config)?);
    Ok(())
}

pub fn init(path: &Path, force: bool) -> Result<(), BoxError> {
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}
