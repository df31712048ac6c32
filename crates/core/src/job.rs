//! Queued work items and the [`JobQueue`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used for ordering in storage; higher runs first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            r if r >= 2 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// One inbound message waiting for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub task_id: String,
    pub channel: String,
    pub peer_id: String,
    pub content: String,
    /// Reply target inside the channel (WebSocket client id, chat id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(channel: impl Into<String>, peer_id: impl Into<String>, content: impl Into<String>) -> Self {
        let channel = channel.into();
        Self {
            task_id: format!("{}-{}", channel, Uuid::new_v4().simple()),
            channel,
            peer_id: peer_id.into(),
            content: content.into(),
            correlation_id: None,
            priority: Priority::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A job handed to a worker, together with the queue's handle for it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub job: Job,
}

/// Job counts by state, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// Transport between producers (the gateway) and consumers (workers).
///
/// Every enqueued job is handed to exactly one `dequeue` caller.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job and return its queue id.
    async fn enqueue(&self, job: Job) -> Result<String, QueueError>;

    /// Wait for the next job. `Ok(None)` means the queue was shut down.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Mark a job as completed.
    async fn ack(&self, job_id: &str) -> Result<(), QueueError>;

    /// Mark a job as failed. Failed jobs are not retried.
    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats::default())
    }
}
