//! Dispatch for RelayClaw: how an inbound message reaches the conversation
//! loop and how its answer gets back out.
//!
//! - **Inline**: the caller waits on the loop ([`inline`])
//! - **Queued**: the message becomes a [`Job`]; a [`Worker`] runs it later,
//!   possibly in another process, and replies through the job's channel

pub mod inline;
pub mod queue;
pub mod worker;

pub use inline::{InlineReply, ToolCallRecord, collect, run_inline};
pub use queue::{InProcessQueue, JobState, queue_from_config};
#[cfg(feature = "sqlite")]
pub use queue::SqliteJobQueue;
pub use worker::{TaskReport, Worker};

use relayclaw_core::error::QueueError;
use relayclaw_core::job::{Job, JobQueue};
use relayclaw_security::{AuditAction, AuditLogger};
use std::str::FromStr;
use tracing::info;

/// `[dispatch] mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Inline,
    Queued,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::Inline),
            "queued" => Ok(Self::Queued),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

/// Receipt for an enqueued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub task_id: String,
    pub job_id: String,
}

/// Audit a new inbound message and put it on the queue.
pub async fn submit(
    queue: &dyn JobQueue,
    audit: &AuditLogger,
    job: Job,
    detail: Option<serde_json::Value>,
) -> Result<Submitted, QueueError> {
    audit.record(
        &job.task_id,
        AuditAction::MessageReceived,
        &job.peer_id,
        &job.channel,
        detail,
    );
    let task_id = job.task_id.clone();
    let channel = job.channel.clone();
    let job_id = queue.enqueue(job).await?;
    info!(task_id = %task_id, job_id = %job_id, channel = %channel, "Message queued");
    Ok(Submitted { task_id, job_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes() {
        assert_eq!("inline".parse::<DispatchMode>(), Ok(DispatchMode::Inline));
        assert_eq!("queued".parse::<DispatchMode>(), Ok(DispatchMode::Queued));
        assert!("later".parse::<DispatchMode>().is_err());
    }

    #[tokio::test]
    async fn submit_audits_then_enqueues() {
        let queue = InProcessQueue::new(4);
        let audit = AuditLogger::in_memory();
        let job = Job::new("webhook", "peer-7", "hello").with_task_id("t-7");

        let receipt = submit(&queue, &audit, job, Some(serde_json::json!({"textLength": 5})))
            .await
            .unwrap();
        assert_eq!(receipt.task_id, "t-7");

        let entries = audit.entries_for("t-7");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::MessageReceived);
        assert_eq!(entries[0].detail.as_ref().unwrap()["textLength"], 5);

        let queued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queued.job_id, receipt.job_id);
    }
}
