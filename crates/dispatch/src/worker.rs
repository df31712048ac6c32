//! Queue worker: runs queued jobs through the conversation loop and
//! delivers each answer exactly once.
//!
//! Per job:
//! 1. Drive the conversation, buffering `text` and auditing tool activity
//! 2. After a clean `done`, make one delivery attempt through the job's channel
//! 3. Ack the job, or mark it failed when the conversation reported an error
//!
//! A failed conversation is audited and logged but never sent to the user.
//! Delivery failures are audited and never retried.

use relayclaw_agent::{AgentStreamEvent, ConversationLoop};
use relayclaw_channels::ChannelRegistry;
use relayclaw_core::job::{JobQueue, QueuedJob};
use relayclaw_security::{AuditAction, AuditLogger};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Longest tool result kept in an audit entry, in characters.
const AUDIT_RESULT_LIMIT: usize = 500;
const DEQUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one job.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub job_id: String,
    /// Text buffered from the conversation. Only delivered when `error` is `None`.
    pub reply: String,
    pub delivered: bool,
    pub error: Option<String>,
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    conversation: ConversationLoop,
    channels: Arc<ChannelRegistry>,
    audit: Arc<AuditLogger>,
    concurrency: usize,
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        conversation: ConversationLoop,
        channels: Arc<ChannelRegistry>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            queue,
            conversation,
            channels,
            audit,
            concurrency: 1,
        }
    }

    /// Number of jobs processed at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process one claimed job end to end.
    pub async fn process(&self, queued: QueuedJob) -> TaskReport {
        let QueuedJob { job_id, job } = queued;
        let task_id = job.task_id.as_str();
        let who = job.peer_id.as_str();
        let channel = job.channel.as_str();
        info!(job_id = %job_id, task_id = %task_id, channel = %channel, peer = %who, "Processing job");

        let mut events = self.conversation.run_conversation(channel, who, &job.content);
        let mut text = String::new();
        let mut failure: Option<String> = None;
        let mut finished = false;

        while let Some(event) = events.recv().await {
            match event {
                AgentStreamEvent::Text { content } => text.push_str(&content),
                AgentStreamEvent::ToolStart { tool_name, tool_args } => {
                    self.audit.record(
                        task_id,
                        AuditAction::ToolCall,
                        who,
                        channel,
                        Some(json!({ "tool": tool_name, "args": tool_args })),
                    );
                }
                AgentStreamEvent::ToolResult { tool_name, tool_result } => {
                    self.audit.record(
                        task_id,
                        AuditAction::ToolResult,
                        who,
                        channel,
                        Some(json!({
                            "tool": tool_name,
                            "result": truncate_chars(&tool_result, AUDIT_RESULT_LIMIT),
                        })),
                    );
                }
                AgentStreamEvent::Error { error } => {
                    self.audit.record(
                        task_id,
                        AuditAction::TaskError,
                        who,
                        channel,
                        Some(json!({ "error": error })),
                    );
                    failure = Some(error);
                }
                AgentStreamEvent::Done { usage } => {
                    self.audit.record(
                        task_id,
                        AuditAction::TaskComplete,
                        who,
                        channel,
                        Some(json!({ "usage": usage })),
                    );
                    finished = true;
                    break;
                }
            }
        }

        if !finished {
            let error = "conversation ended without completing".to_string();
            self.audit.record(
                task_id,
                AuditAction::TaskError,
                who,
                channel,
                Some(json!({ "error": error })),
            );
            failure.get_or_insert(error);
        }

        let delivered = match &failure {
            Some(_) => false,
            None if text.trim().is_empty() => {
                warn!(job_id = %job_id, task_id = %task_id, "Conversation produced no text; nothing to deliver");
                false
            }
            None => self.deliver(&job_id, &job, &text).await,
        };

        let settled = match &failure {
            Some(reason) => {
                warn!(job_id = %job_id, task_id = %task_id, error = %reason, "Job failed");
                self.queue.fail(&job_id, reason).await
            }
            None => self.queue.ack(&job_id).await,
        };
        if let Err(e) = settled {
            error!(job_id = %job_id, error = %e, "Could not record job outcome");
        }

        debug!(job_id = %job_id, delivered, "Job processed");
        TaskReport {
            task_id: job.task_id.clone(),
            job_id,
            reply: text,
            delivered,
            error: failure,
        }
    }

    /// The single delivery attempt for a job.
    async fn deliver(&self, job_id: &str, job: &relayclaw_core::Job, reply: &str) -> bool {
        let outcome = self
            .channels
            .reply(&job.channel, job.correlation_id.as_deref(), &job.peer_id, reply)
            .await;

        let reason = match outcome {
            Ok(true) => return true,
            Ok(false) => "reply target unavailable".to_string(),
            Err(e) => e.to_string(),
        };
        error!(
            job_id = %job_id,
            task_id = %job.task_id,
            channel = %job.channel,
            reason = %reason,
            "Reply delivery failed"
        );
        self.audit.record(
            &job.task_id,
            AuditAction::DeliveryFailed,
            &job.peer_id,
            &job.channel,
            Some(json!({ "reason": reason })),
        );
        false
    }

    /// Consume the queue until it closes or `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "Worker started");
        let mut slots = JoinSet::new();
        for slot in 0..self.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { worker.consume(slot, shutdown).await });
        }
        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker slot panicked");
            }
        }
        info!("Worker stopped");
    }

    async fn consume(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.dequeue() => next,
            };
            match next {
                Ok(Some(job)) => {
                    self.process(job).await;
                }
                Ok(None) => {
                    debug!(slot, "Queue closed");
                    break;
                }
                Err(e) => {
                    error!(slot, error = %e, "Dequeue failed");
                    tokio::time::sleep(DEQUEUE_BACKOFF).await;
                }
            }
        }
    }
}
