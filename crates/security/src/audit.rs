//! Audit logging: what the workers did, and for whom.
//!
//! Recording is fire-and-forget: sinks swallow their own failures so an
//! unwritable audit file never interrupts a task.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Auditable actions on the queued path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// An inbound message was accepted for processing
    MessageReceived,
    /// A tool was invoked
    ToolCall,
    /// A tool returned
    ToolResult,
    /// The conversation finished
    TaskComplete,
    /// The conversation reported an error
    TaskError,
    /// The final reply could not be delivered
    DeliveryFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

/// A single audit log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(with = "ts_millis")]
    pub ts: DateTime<Utc>,
    pub task_id: String,
    pub action: AuditAction,
    /// The peer the task runs for.
    pub who: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

mod ts_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Where audit entries go.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Fans entries out to its sinks and optionally keeps them in memory.
pub struct AuditLogger {
    entries: Option<Mutex<Vec<AuditEntry>>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AuditLogger {
    /// Keep entries in memory only. Useful for tests.
    pub fn in_memory() -> Self {
        Self {
            entries: Some(Mutex::new(Vec::new())),
            sinks: Vec::new(),
        }
    }

    /// Forward to `sinks` without keeping a copy.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self { entries: None, sinks }
    }

    /// The production setup: always trace, and append JSONL under `dir` when given.
    pub fn from_dir(dir: Option<&Path>) -> Self {
        let mut sinks: Vec<Box<dyn AuditSink>> = vec![Box::new(TracingSink)];
        if let Some(dir) = dir {
            sinks.push(Box::new(JsonlFileSink::new(dir)));
        }
        Self::with_sinks(sinks)
    }

    pub fn record(
        &self,
        task_id: &str,
        action: AuditAction,
        who: &str,
        channel: &str,
        detail: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            ts: Utc::now(),
            task_id: task_id.into(),
            action,
            who: who.into(),
            channel: channel.into(),
            detail,
        };

        if let Some(entries) = &self.entries {
            entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry.clone());
        }
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Entries kept in memory (empty unless built with [`AuditLogger::in_memory`]).
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .as_ref()
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, task_id: &str) -> Vec<AuditEntry> {
        self.entries().into_iter().filter(|e| e.task_id == task_id).collect()
    }

    pub fn count(&self) -> usize {
        self.entries
            .as_ref()
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }
}

/// Logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            task_id = %entry.task_id,
            action = entry.action.as_str(),
            who = %entry.who,
            channel = %entry.channel,
            detail = ?entry.detail,
            "AUDIT"
        );
    }
}

/// Appends one JSON object per line to `audit-YYYY-MM-DD.jsonl` in a directory.
pub struct JsonlFileSink {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn file_for(&self, ts: &DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", ts.format("%Y-%m-%d")))
    }

    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(&entry.ts))?;
        file.write_all(line.as_bytes())
    }
}

impl AuditSink for JsonlFileSink {
    fn record(&self, entry: &AuditEntry) {
        if let Err(e) = self.append(entry) {
            warn!(
                dir = %self.dir.display(),
                task_id = %entry.task_id,
                error = %e,
                ts = %entry.ts.to_rfc3339_opts(SecondsFormat::Secs, true),
                "Failed to write audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_and_retrieve_entries() {
        let logger = AuditLogger::in_memory();
        logger.record("t1", AuditAction::ToolCall, "ou_1", "lark", Some(serde_json::json!({"tool": "run_shell"})));
        logger.record("t2", AuditAction::TaskComplete, "ou_2", "webhook", None);

        assert_eq!(logger.count(), 2);
        let t1 = logger.entries_for("t1");
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].who, "ou_1");
        assert_eq!(t1[0].detail.as_ref().unwrap()["tool"], "run_shell");
    }

    #[test]
    fn entry_wire_shape() {
        let entry = AuditEntry {
            ts: Utc::now(),
            task_id: "lark-evt-abc123".into(),
            action: AuditAction::DeliveryFailed,
            who: "ou_1".into(),
            channel: "lark".into(),
            detail: None,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["taskId"], "lark-evt-abc123");
        assert_eq!(v["action"], "delivery_failed");
        assert!(v.get("detail").is_none());
        assert!(v["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn custom_sink_receives_entries() {
        struct Collect(Arc<Mutex<Vec<String>>>);
        impl AuditSink for Collect {
            fn record(&self, entry: &AuditEntry) {
                self.0.lock().unwrap().push(entry.action.as_str().to_string());
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let logger = AuditLogger::with_sinks(vec![Box::new(Collect(seen.clone()))]);
        logger.record("t", AuditAction::TaskError, "p", "webchat", None);

        assert_eq!(*seen.lock().unwrap(), vec!["task_error"]);
        assert_eq!(logger.count(), 0);
    }

    #[test]
    fn jsonl_sink_appends_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::from_dir(Some(dir.path()));
        logger.record("t1", AuditAction::ToolCall, "p", "cli", Some(serde_json::json!({"tool": "x"})));
        logger.record("t1", AuditAction::TaskComplete, "p", "cli", None);

        let sink = JsonlFileSink::new(dir.path());
        let content = std::fs::read_to_string(sink.file_for(&Utc::now())).unwrap();
        let lines: Vec<AuditEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].action, AuditAction::ToolCall);
        assert_eq!(lines[1].action, AuditAction::TaskComplete);
    }

    #[test]
    fn unwritable_dir_is_swallowed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot be used as the audit directory.
        let sink = JsonlFileSink::new(file.path());
        let logger = AuditLogger::with_sinks(vec![Box::new(sink)]);
        logger.record("t", AuditAction::TaskComplete, "p", "cli", None);
    }

    #[test]
    fn debug_format() {
        let logger = AuditLogger::default();
        let debug_str = format!("{logger:?}");
        assert!(debug_str.contains("entry_count"));
    }
}
