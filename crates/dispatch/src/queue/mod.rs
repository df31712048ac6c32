//! Job queue transports.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InProcessQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobQueue;

use relayclaw_config::DispatchConfig;
use relayclaw_core::error::QueueError;
use relayclaw_core::job::JobQueue;
use std::sync::Arc;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }

    pub fn parse(status: &str, error: Option<String>) -> Option<Self> {
        match status {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed(error.unwrap_or_default())),
            _ => None,
        }
    }
}

/// Build the queue selected by `[dispatch]`.
pub async fn queue_from_config(config: &DispatchConfig) -> Result<Arc<dyn JobQueue>, QueueError> {
    match config.queue.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.queue_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| QueueError::Storage(format!("create {}: {e}", parent.display())))?;
                }
            }
            let url = if config.queue_path.starts_with("sqlite:") {
                config.queue_path.clone()
            } else {
                format!("sqlite://{}", config.queue_path)
            };
            let queue = SqliteJobQueue::new(
                &url,
                std::time::Duration::from_millis(config.poll_interval_ms.max(1)),
            )
            .await?;
            Ok(Arc::new(queue))
        }
        "memory" => Ok(Arc::new(InProcessQueue::new(config.queue_capacity))),
        other => Err(QueueError::Storage(format!("unsupported queue backend '{other}'"))),
    }
}
