//! Provider construction from configuration.
//!
//! One provider is built at startup and injected into the conversation loop;
//! there is no global registry to look it up from.

use std::sync::Arc;

use relayclaw_config::{AppConfig, ProviderConfig};
use relayclaw_core::error::ProviderError;
use relayclaw_core::provider::Provider;
use tracing::{info, warn};

use crate::anthropic::{self, AnthropicProvider};
use crate::openai_compat::{self, OpenAiCompatProvider};
use crate::responses::ResponsesProvider;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// Pick the provider to build.
///
/// A keyed provider other than openai that has no key falls back to openai,
/// which also covers keyless OpenAI-compatible servers.
pub fn resolve_provider_name(config: &AppConfig) -> &'static str {
    match config.agent.default_provider.as_str() {
        "anthropic" if config.providers.anthropic.has_api_key() => "anthropic",
        "responses" if config.providers.responses.has_api_key() => "responses",
        "openai" => "openai",
        other => {
            warn!(requested = %other, "Provider has no API key configured, falling back to openai");
            "openai"
        }
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() { default.to_string() } else { value.to_string() }
}

/// Build the configured provider.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider: Arc<dyn Provider> = match resolve_provider_name(config) {
        "anthropic" => build_anthropic(&config.providers.anthropic),
        "responses" => build_responses(&config.providers.responses)?,
        _ => build_openai(&config.providers.openai),
    };
    info!(provider = %provider.name(), model = %provider.model(), "Provider initialized");
    Ok(provider)
}

fn build_openai(cfg: &ProviderConfig) -> Arc<dyn Provider> {
    if !cfg.has_api_key() {
        warn!("No OpenAI API key configured; requests will be sent unauthenticated");
    }
    Arc::new(OpenAiCompatProvider::new(
        "openai",
        or_default(&cfg.base_url, openai_compat::DEFAULT_BASE_URL),
        cfg.api_key.clone().unwrap_or_default(),
        or_default(&cfg.model, DEFAULT_OPENAI_MODEL),
    ))
}

fn build_anthropic(cfg: &ProviderConfig) -> Arc<dyn Provider> {
    Arc::new(
        AnthropicProvider::new(
            cfg.api_key.clone().unwrap_or_default(),
            or_default(&cfg.model, DEFAULT_ANTHROPIC_MODEL),
        )
        .with_base_url(or_default(&cfg.base_url, anthropic::DEFAULT_BASE_URL)),
    )
}

fn build_responses(cfg: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    if cfg.base_url.is_empty() || cfg.model.is_empty() {
        return Err(ProviderError::NotConfigured(
            "providers.responses needs base_url and model".into(),
        ));
    }
    Ok(Arc::new(
        ResponsesProvider::new(&cfg.base_url, cfg.api_key.clone().unwrap_or_default(), &cfg.model)
            .with_max_redirects(cfg.max_redirects),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_openai() {
        let config = AppConfig::default();
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-4o");
    }

    #[test]
    fn anthropic_without_key_falls_back() {
        let mut config = AppConfig::default();
        config.agent.default_provider = "anthropic".into();
        assert_eq!(resolve_provider_name(&config), "openai");

        config.providers.anthropic.api_key = Some("sk-ant".into());
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model(), "claude-sonnet-4-20250514");
    }

    #[test]
    fn responses_requires_endpoint() {
        let mut config = AppConfig::default();
        config.agent.default_provider = "responses".into();
        config.providers.responses.api_key = Some("ak".into());
        assert!(matches!(build_from_config(&config), Err(ProviderError::NotConfigured(_))));

        config.providers.responses.base_url = "https://gw.example.com/v1".into();
        config.providers.responses.model = "gpt-4.1".into();
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "responses");
    }
}
