//! Built-in tool implementations for RelayClaw.
//!
//! The built-ins cover the host shell, the clock and a web search
//! placeholder. User skills are loaded from a directory of
//! `*.skill.toml` manifests and registered next to them.

pub mod datetime;
pub mod shell;
pub mod skills;
pub mod web_search;

use relayclaw_core::tool::ToolRegistry;
use std::sync::Arc;

pub use skills::{CommandSkill, RescanReport, SkillLoader, SkillManifest};

/// Create a tool registry with the built-in tools.
///
/// The shell tool has no allowlist; use [`registry_with_shell_allowlist`]
/// to restrict it.
pub fn default_registry() -> ToolRegistry {
    registry_with_shell_allowlist(Vec::new())
}

/// Like [`default_registry`], but `run_shell` only accepts the listed
/// base commands.
pub fn registry_with_shell_allowlist(allowed_commands: Vec<String>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(shell::ShellTool::new(allowed_commands)));
    registry.register(Arc::new(datetime::DateTimeTool));
    registry.register(Arc::new(web_search::WebSearchTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry();
        assert_eq!(
            registry.names(),
            vec!["get_current_datetime", "run_shell", "web_search"]
        );
        let defs = registry.definitions();
        assert!(defs.iter().all(|d| d.parameters["type"] == "object"));
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_payload() {
        let registry = default_registry();
        let out = registry.execute("nope", serde_json::json!({})).await;
        assert!(out.contains("Tool 'nope' not found"));
    }
}
