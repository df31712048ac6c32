//! User-defined skills loaded from a directory.
//!
//! Each `<name>.skill.toml` file describes one skill:
//!
//! ```toml
//! name = "hello"
//! description = "Greets someone by name"
//! command = "jq -r '\"Hello, \" + .name'"
//! timeout_ms = 10000
//!
//! [parameters]
//! type = "object"
//! required = ["name"]
//! [parameters.properties.name]
//! type = "string"
//! ```
//!
//! A skill is exposed to the model as the tool `skill_<name>` with the
//! description prefixed by `[Skill]`. When invoked, the command runs under
//! `sh -c` with the JSON arguments on stdin and in `SKILL_ARGS`.

use async_trait::async_trait;
use relayclaw_core::error::ToolError;
use relayclaw_core::tool::{Tool, ToolRegistry};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SKILL_SUFFIX: &str = ".skill.toml";
const DEFAULT_SKILL_TIMEOUT_MS: u64 = 30_000;

/// On-disk skill manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A skill backed by a shell command.
pub struct CommandSkill {
    tool_name: String,
    description: String,
    manifest: SkillManifest,
    workdir: Option<PathBuf>,
}

impl CommandSkill {
    pub fn new(manifest: SkillManifest) -> Self {
        Self {
            tool_name: format!("skill_{}", manifest.name),
            description: format!("[Skill] {}", manifest.description),
            manifest,
            workdir: None,
        }
    }

    /// Run the command from this directory (the manifest's directory when
    /// loaded from disk).
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn skill_name(&self) -> &str {
        &self.manifest.name
    }

    fn failed(&self, reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: self.tool_name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Tool for CommandSkill {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.manifest.parameters.clone()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args = arguments.to_string();
        let timeout_ms = self.manifest.timeout_ms.unwrap_or(DEFAULT_SKILL_TIMEOUT_MS);
        debug!(skill = %self.manifest.name, "Running skill");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", &self.manifest.command])
            .env("SKILL_ARGS", &args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| self.failed(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // Written off the timed path: a command that never reads stdin must
            // not hold up the timeout. The pipe breaks once the child exits.
            tokio::spawn(async move {
                let _ = stdin.write_all(args.as_bytes()).await;
            });
        }

        let output = match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.failed(e.to_string())),
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool_name: self.tool_name.clone(),
                    timeout_ms,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(self.failed(if stderr.is_empty() {
                format!("exited with {:?}", output.status.code())
            } else {
                stderr
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Result of one [`SkillLoader::rescan`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RescanReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl RescanReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Loads skills from a directory and keeps a registry in sync with it.
pub struct SkillLoader {
    dir: PathBuf,
    /// tool name -> (manifest path, modification time) of what is registered.
    loaded: Mutex<HashMap<String, (PathBuf, Option<SystemTime>)>>,
}

impl SkillLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_paths(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to read skills directory");
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(SKILL_SUFFIX))
            })
            .collect();
        paths.sort();
        paths
    }

    /// Parse every manifest in the directory. Bad manifests are logged and skipped.
    pub fn load_all(&self) -> Vec<CommandSkill> {
        self.manifest_paths()
            .into_iter()
            .filter_map(|path| match load_skill(&path) {
                Ok(skill) => {
                    info!(name = %skill.skill_name(), "Loaded skill");
                    Some(skill)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load skill");
                    None
                }
            })
            .collect()
    }

    /// Bring `registry` in line with the directory: register new skills,
    /// re-register changed ones and unregister skills whose file is gone.
    pub fn rescan(&self, registry: &ToolRegistry) -> RescanReport {
        let mut report = RescanReport::default();
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = HashMap::new();

        for path in self.manifest_paths() {
            let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            let unchanged = loaded
                .values()
                .any(|(p, t)| p == &path && *t == mtime && mtime.is_some());
            if unchanged {
                if let Some((name, entry)) = loaded.iter().find(|(_, (p, _))| p == &path) {
                    seen.insert(name.clone(), entry.clone());
                }
                continue;
            }

            match load_skill(&path) {
                Ok(skill) => {
                    let name = skill.name().to_string();
                    if loaded.contains_key(&name) {
                        report.updated.push(name.clone());
                    } else {
                        report.added.push(name.clone());
                    }
                    registry.register(Arc::new(skill));
                    seen.insert(name, (path, mtime));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load skill");
                }
            }
        }

        for name in loaded.keys() {
            if !seen.contains_key(name) {
                registry.unregister(name);
                report.removed.push(name.clone());
            }
        }

        *loaded = seen;
        report.added.sort();
        report.updated.sort();
        report.removed.sort();
        if !report.is_empty() {
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "Skills reloaded"
            );
        }
        report
    }

    /// Rescan every `interval` until the returned handle is aborted.
    pub fn hot_reload(self: Arc<Self>, registry: Arc<ToolRegistry>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.rescan(&registry);
            }
        })
    }
}

fn load_skill(path: &Path) -> Result<CommandSkill, ToolError> {
    let content = std::fs::read_to_string(path).map_err(|e| ToolError::ExecutionFailed {
        tool_name: "skill".into(),
        reason: format!("Failed to read manifest: {e}"),
    })?;
    let manifest: SkillManifest = toml::from_str(&content)
        .map_err(|e| ToolError::InvalidArguments(format!("Invalid skill manifest: {e}")))?;

    if manifest.name.is_empty() || manifest.command.is_empty() {
        return Err(ToolError::InvalidArguments(
            "Skill manifest needs a name and a command".into(),
        ));
    }

    let skill = CommandSkill::new(manifest);
    Ok(match path.parent() {
        Some(dir) => skill.with_workdir(dir),
        None => skill,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, file: &str, name: &str, command: &str) {
        let body = format!(
            "name = \"{name}\"\ndescription = \"Says {name}\"\ncommand = '''{command}'''\n"
        );
        std::fs::write(dir.join(file), body).unwrap();
    }

    #[test]
    fn naming_and_description() {
        let skill = CommandSkill::new(SkillManifest {
            name: "hello".into(),
            description: "Greets".into(),
            command: "echo hi".into(),
            parameters: default_parameters(),
            timeout_ms: None,
        });
        assert_eq!(skill.name(), "skill_hello");
        assert_eq!(skill.description(), "[Skill] Greets");
        assert_eq!(skill.parameters_schema()["type"], "object");
    }

    #[test]
    fn load_all_skips_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a.skill.toml", "a", "echo a");
        std::fs::write(dir.path().join("broken.skill.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let skills = SkillLoader::new(dir.path()).load_all();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name(), "skill_a");
    }

    #[test]
    fn missing_dir_loads_nothing() {
        let skills = SkillLoader::new("/nonexistent/relayclaw/skills").load_all();
        assert!(skills.is_empty());
    }

    #[tokio::test]
    async fn skill_receives_args_on_stdin_and_env() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "echo.skill.toml", "echo", "cat; echo; echo \"$SKILL_ARGS\"");
        let skills = SkillLoader::new(dir.path()).load_all();

        let out = skills[0].execute(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out, "{\"x\":1}\n{\"x\":1}");
    }

    #[tokio::test]
    async fn failing_skill_reports_stderr() {
        let skill = CommandSkill::new(SkillManifest {
            name: "bad".into(),
            description: "Fails".into(),
            command: "echo nope >&2; exit 1".into(),
            parameters: default_parameters(),
            timeout_ms: None,
        });
        let err = skill.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { ref reason, .. } if reason == "nope"));
    }

    #[tokio::test]
    async fn timeout_holds_when_skill_ignores_large_stdin() {
        let skill = CommandSkill::new(SkillManifest {
            name: "sleepy".into(),
            description: "Never reads stdin".into(),
            command: "sleep 5".into(),
            parameters: default_parameters(),
            timeout_ms: Some(200),
        });
        let started = std::time::Instant::now();
        let err = skill
            .execute(serde_json::json!({ "blob": "x".repeat(100_000) }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 200, .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn rescan_tracks_additions_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let loader = SkillLoader::new(dir.path());

        write_skill(dir.path(), "a.skill.toml", "a", "echo a");
        write_skill(dir.path(), "b.skill.toml", "b", "echo b");
        let report = loader.rescan(&registry);
        assert_eq!(report.added, vec!["skill_a", "skill_b"]);
        assert!(registry.contains("skill_a"));

        // Nothing changed on disk.
        assert!(loader.rescan(&registry).is_empty());

        std::fs::remove_file(dir.path().join("a.skill.toml")).unwrap();
        let report = loader.rescan(&registry);
        assert_eq!(report.removed, vec!["skill_a"]);
        assert!(!registry.contains("skill_a"));
        assert!(registry.contains("skill_b"));
    }
}
