//! Shell tool: execute system commands.
//!
//! Supports command allowlisting, a working directory, and a timeout after
//! which the child process is killed.

use async_trait::async_trait;
use relayclaw_core::error::ToolError;
use relayclaw_core::tool::Tool;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_STDOUT_CHARS: usize = 10_000;
const MAX_STDERR_CHARS: usize = 5_000;

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true; // No allowlist = all commands allowed
        }

        // Extract the base command (first word)
        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();

        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn default_cwd() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/tmp".into())
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the host machine. Use with caution. Returns stdout, stderr, and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory for the command. Defaults to home directory."
                },
                "timeout": {
                    "type": "number",
                    "description": "Timeout in milliseconds. Defaults to 30000."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "run_shell".into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        let cwd = arguments["cwd"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(String::from)
            .unwrap_or_else(default_cwd);
        let timeout_ms = arguments["timeout"]
            .as_u64()
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        debug!(command = %command, cwd = %cwd, timeout_ms, "Executing shell command");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "run_shell".into(),
                reason: e.to_string(),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "run_shell".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_ms, "Command timed out, killed");
                return Err(ToolError::Timeout {
                    tool_name: "run_shell".into(),
                    timeout_ms,
                });
            }
        };

        let exit_code = output.status.code();
        if !output.status.success() {
            warn!(command = %command, exit_code = ?exit_code, "Command failed");
        }

        Ok(serde_json::json!({
            "exitCode": exit_code,
            "stdout": truncate_chars(&String::from_utf8_lossy(&output.stdout), MAX_STDOUT_CHARS),
            "stderr": truncate_chars(&String::from_utf8_lossy(&output.stderr), MAX_STDERR_CHARS),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(out: &str) -> serde_json::Value {
        serde_json::from_str(out).unwrap()
    }

    #[test]
    fn allowlist_check() {
        let tool = ShellTool::new(vec!["ls".into(), "cat".into(), "git".into()]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("git status"));
        assert!(!tool.is_command_allowed("rm -rf /"));
        assert!(!tool.is_command_allowed("sudo something"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let tool = ShellTool::new(vec![]);
        assert!(tool.is_command_allowed("anything goes"));
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[tokio::test]
    async fn execute_echo() {
        let tool = ShellTool::new(vec![]);
        let out = tool.execute(serde_json::json!({"command": "echo hello"})).await.unwrap();
        let v = parse(&out);
        assert_eq!(v["exitCode"], 0);
        assert_eq!(v["stdout"], "hello\n");
        assert_eq!(v["stderr"], "");
    }

    #[tokio::test]
    async fn honours_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(vec![]);
        let out = tool
            .execute(serde_json::json!({"command": "pwd", "cwd": dir.path().to_str().unwrap()}))
            .await
            .unwrap();
        let v = parse(&out);
        let printed = v["stdout"].as_str().unwrap().trim().to_string();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&printed).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let tool = ShellTool::new(vec![]);
        let out = tool
            .execute(serde_json::json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap();
        let v = parse(&out);
        assert_eq!(v["exitCode"], 3);
        assert_eq!(v["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let tool = ShellTool::new(vec![]);
        let started = std::time::Instant::now();
        let result = tool
            .execute(serde_json::json!({"command": "sleep 5", "timeout": 100}))
            .await;
        assert!(matches!(result, Err(ToolError::Timeout { timeout_ms: 100, .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn blocked_command() {
        let tool = ShellTool::new(vec!["ls".into()]);
        let result = tool.execute(serde_json::json!({"command": "rm -rf /"})).await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn missing_command_is_invalid() {
        let tool = ShellTool::new(vec![]);
        let result = tool.execute(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }
}
