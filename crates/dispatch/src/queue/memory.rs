//! In-process job queue on a bounded tokio mpsc channel.
//!
//! For single-process deployments where the gateway and the workers share
//! a runtime. Jobs are handed out FIFO; priority only matters for the
//! SQLite queue. Finished jobs are remembered only for the most recent
//! [`FINISHED_HISTORY`] outcomes.

use async_trait::async_trait;
use relayclaw_core::error::QueueError;
use relayclaw_core::job::{Job, JobQueue, QueueStats, QueuedJob};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::JobState;

/// How many finished jobs keep their state for `state` and `stats`.
pub const FINISHED_HISTORY: usize = 100;

#[derive(Default)]
struct Ledger {
    states: HashMap<String, JobState>,
    finished: VecDeque<String>,
}

impl Ledger {
    fn finish(&mut self, job_id: &str, state: JobState) -> Result<(), QueueError> {
        let Some(current) = self.states.get_mut(job_id) else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };
        let first_finish = matches!(current, JobState::Pending | JobState::Running);
        *current = state;
        if first_finish {
            self.finished.push_back(job_id.to_string());
            while self.finished.len() > FINISHED_HISTORY {
                if let Some(old) = self.finished.pop_front() {
                    self.states.remove(&old);
                }
            }
        }
        Ok(())
    }
}

pub struct InProcessQueue {
    tx: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    rx: AsyncMutex<mpsc::Receiver<QueuedJob>>,
    ledger: Mutex<Ledger>,
}

impl InProcessQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Stop accepting jobs. Workers drain what is queued, then see `None`.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.ledger().states.get(job_id).cloned()
    }

    /// Number of jobs whose state is still tracked.
    pub fn tracked(&self) -> usize {
        self.ledger().states.len()
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, job: Job) -> Result<String, QueueError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(QueueError::Closed)?;

        let job_id = Uuid::new_v4().to_string();
        self.ledger().states.insert(job_id.clone(), JobState::Pending);

        let task_id = job.task_id.clone();
        if tx
            .send(QueuedJob {
                job_id: job_id.clone(),
                job,
            })
            .await
            .is_err()
        {
            self.ledger().states.remove(&job_id);
            return Err(QueueError::Closed);
        }
        debug!(job_id = %job_id, task_id = %task_id, "Job enqueued");
        Ok(job_id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let next = self.rx.lock().await.recv().await;
        if let Some(queued) = &next {
            if let Some(state) = self.ledger().states.get_mut(&queued.job_id) {
                *state = JobState::Running;
            }
        }
        Ok(next)
    }

    async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        self.ledger().finish(job_id, JobState::Done)
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        self.ledger().finish(job_id, JobState::Failed(reason.to_string()))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let ledger = self.ledger();
        let mut stats = QueueStats::default();
        for state in ledger.states.values() {
            match state {
                JobState::Pending => stats.pending += 1,
                JobState::Running => stats.running += 1,
                JobState::Done => stats.done += 1,
                JobState::Failed(_) => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
