//! SQLite job queue shared between processes.
//!
//! The API process enqueues and a separate worker process claims. A claim
//! is a single `UPDATE ... RETURNING` over the highest-priority, oldest
//! pending row, so two workers can never take the same job.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use relayclaw_core::error::QueueError;
use relayclaw_core::job::{Job, JobQueue, Priority, QueueStats, QueuedJob};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::JobState;

pub struct SqliteJobQueue {
    pool: SqlitePool,
    poll_interval: Duration,
    notify: Notify,
    closed: AtomicBool,
}

fn storage(context: &str) -> impl Fn(sqlx::Error) -> QueueError + '_ {
    move |e| QueueError::Storage(format!("{context}: {e}"))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteJobQueue {
    /// Open (or create) the queue database at `path`.
    pub async fn new(path: &str, poll_interval: Duration) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| QueueError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to open SQLite: {e}")))?;

        let queue = Self::from_pool(pool, poll_interval).await?;
        info!(path = %path, "SQLite job queue initialized");
        Ok(queue)
    }

    pub async fn from_pool(pool: SqlitePool, poll_interval: Duration) -> Result<Self, QueueError> {
        let queue = Self {
            pool,
            poll_interval,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        };
        queue.run_migrations().await?;
        Ok(queue)
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                task_id         TEXT NOT NULL,
                channel         TEXT NOT NULL,
                peer_id         TEXT NOT NULL,
                content         TEXT NOT NULL,
                correlation_id  TEXT,
                priority        INTEGER NOT NULL DEFAULT 1,
                status          TEXT NOT NULL DEFAULT 'pending',
                error           TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage("jobs table"))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority DESC, seq)")
            .execute(&self.pool)
            .await
            .map_err(storage("jobs index"))?;

        debug!("SQLite queue migrations complete");
        Ok(())
    }

    /// Stop handing out jobs; blocked `dequeue` calls return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Claim the next pending job, if any, without waiting.
    pub async fn try_claim(&self) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', updated_at = ?
            WHERE seq = (
                SELECT seq FROM jobs WHERE status = 'pending'
                ORDER BY priority DESC, seq ASC LIMIT 1
            ) AND status = 'pending'
            RETURNING id, task_id, channel, peer_id, content, correlation_id, priority, created_at
            "#,
        )
        .bind(ts(&Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("claim job"))?;

        row.map(|r| Self::row_to_job(&r)).transpose()
    }

    fn row_to_job(row: &SqliteRow) -> Result<QueuedJob, QueueError> {
        let get = |col: &str| -> Result<String, QueueError> {
            row.try_get::<String, _>(col).map_err(|e| QueueError::Storage(format!("{col} column: {e}")))
        };
        let created_at = DateTime::parse_from_rfc3339(&get("created_at")?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let priority: i64 = row.try_get("priority").map_err(storage("priority column"))?;
        let correlation_id: Option<String> =
            row.try_get("correlation_id").map_err(storage("correlation_id column"))?;

        Ok(QueuedJob {
            job_id: get("id")?,
            job: Job {
                task_id: get("task_id")?,
                channel: get("channel")?,
                peer_id: get("peer_id")?,
                content: get("content")?,
                correlation_id,
                priority: Priority::from_rank(priority),
                created_at,
            },
        })
    }

    async fn finish(&self, job_id: &str, state: &JobState) -> Result<(), QueueError> {
        let error = match state {
            JobState::Failed(reason) => Some(reason.as_str()),
            _ => None,
        };
        let result = sqlx::query("UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(error)
            .bind(ts(&Utc::now()))
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(storage("update job"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Current state of a job.
    pub async fn state(&self, job_id: &str) -> Result<Option<JobState>, QueueError> {
        let row = sqlx::query("SELECT status, error FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("load job"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(storage("status column"))?;
        let error: Option<String> = row.try_get("error").map_err(storage("error column"))?;
        Ok(JobState::parse(&status, error))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: Job) -> Result<String, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let job_id = Uuid::new_v4().to_string();
        let now = ts(&Utc::now());
        sqlx::query(
            r#"
            INSERT INTO jobs (id, task_id, channel, peer_id, content, correlation_id, priority,
                              status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(&job.task_id)
        .bind(&job.channel)
        .bind(&job.peer_id)
        .bind(&job.content)
        .bind(&job.correlation_id)
        .bind(job.priority.rank())
        .bind(ts(&job.created_at))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage("insert job"))?;

        debug!(job_id = %job_id, task_id = %job.task_id, "Job enqueued");
        self.notify.notify_one();
        Ok(job_id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }
            // Jobs from other processes only show up by polling.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        self.finish(job_id, &JobState::Done).await
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        self.finish(job_id, &JobState::Failed(reason.to_string())).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(storage("job stats"))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(storage("status column"))?;
            let n: i64 = row.try_get("n").map_err(storage("count column"))?;
            let n = n.max(0) as u64;
            match status.as_str() {
                "pending" => stats.pending = n,
                "running" => stats.running = n,
                "done" => stats.done = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}
