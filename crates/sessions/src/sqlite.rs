//! SQLite session store.
//!
//! Two tables:
//! - `sessions`: one row per channel/peer pair
//! - `session_messages`: the transcript, one JSON-encoded message per row,
//!   ordered by an autoincrement sequence
//!
//! Appends run in a transaction that inserts the message and deletes
//! whatever falls out of the history window.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use relayclaw_core::error::SessionError;
use relayclaw_core::message::ChatMessage;
use relayclaw_core::session::{Session, SessionStore, SessionSummary, session_id, trim_history};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};

pub struct SqliteSessionStore {
    pool: SqlitePool,
    max_messages: usize,
}

fn storage(context: &str) -> impl Fn(sqlx::Error) -> SessionError + '_ {
    move |e| SessionError::Storage(format!("{context}: {e}"))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str, max_messages: usize) -> Result<Self, SessionError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| SessionError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool, max_messages).await?;
        info!(path = %path, "SQLite session store initialized");
        Ok(store)
    }

    /// Use an existing pool.
    pub async fn from_pool(pool: SqlitePool, max_messages: usize) -> Result<Self, SessionError> {
        let store = Self { pool, max_messages };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), SessionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY,
                channel     TEXT NOT NULL,
                peer_id     TEXT NOT NULL,
                metadata    TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::MigrationFailed(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                body        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::MigrationFailed(format!("session_messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_messages_session ON session_messages(session_id, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::MigrationFailed(format!("session_messages index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at DESC)")
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::MigrationFailed(format!("updated_at index: {e}")))?;

        debug!("SQLite session migrations complete");
        Ok(())
    }

    fn row_to_session(row: &SqliteRow, messages: Vec<ChatMessage>) -> Result<Session, SessionError> {
        let metadata_json: String = row.try_get("metadata").map_err(storage("metadata column"))?;
        let created_at: String = row.try_get("created_at").map_err(storage("created_at column"))?;
        let updated_at: String = row.try_get("updated_at").map_err(storage("updated_at column"))?;
        Ok(Session {
            id: row.try_get("id").map_err(storage("id column"))?,
            channel: row.try_get("channel").map_err(storage("channel column"))?,
            peer_id: row.try_get("peer_id").map_err(storage("peer_id column"))?,
            messages,
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn decode_messages(rows: &[SqliteRow]) -> Vec<(i64, ChatMessage)> {
        rows.iter()
            .filter_map(|row| {
                let seq: i64 = row.try_get("seq").ok()?;
                let body: String = row.try_get("body").ok()?;
                match serde_json::from_str(&body) {
                    Ok(msg) => Some((seq, msg)),
                    Err(e) => {
                        warn!(seq, error = %e, "Skipping undecodable session message");
                        None
                    }
                }
            })
            .collect()
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError> {
        let rows = sqlx::query("SELECT seq, body FROM session_messages WHERE session_id = ?1 ORDER BY seq ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage("load messages"))?;
        Ok(Self::decode_messages(&rows).into_iter().map(|(_, m)| m).collect())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_or_create(&self, channel: &str, peer_id: &str) -> Result<Session, SessionError> {
        let id = session_id(channel, peer_id);
        let now = ts(&Utc::now());
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, channel, peer_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(&id)
        .bind(channel)
        .bind(peer_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage("create session"))?;

        self.get(&id)
            .await?
            .ok_or_else(|| SessionError::Storage(format!("session {id} vanished after insert")))
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("get session"))?;
        match row {
            Some(row) => {
                let messages = self.load_messages(session_id).await?;
                Ok(Some(Self::row_to_session(&row, messages)?))
            }
            None => Ok(None),
        }
    }

    async fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        let body = serde_json::to_string(&message)
            .map_err(|e| SessionError::Storage(format!("encode message: {e}")))?;
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;

        let updated = sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(ts(&Utc::now()))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("touch session"))?;
        if updated.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        sqlx::query("INSERT INTO session_messages (session_id, body) VALUES (?1, ?2)")
            .bind(session_id)
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(storage("insert message"))?;

        let rows = sqlx::query("SELECT seq, body FROM session_messages WHERE session_id = ?1 ORDER BY seq ASC")
            .bind(session_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage("load window"))?;
        let window = Self::decode_messages(&rows);
        let mut kept: Vec<ChatMessage> = window.iter().map(|(_, m)| m.clone()).collect();
        trim_history(&mut kept, self.max_messages);

        // Trimming only ever removes a prefix.
        let dropped = window.len() - kept.len();
        if let Some((last_dropped, _)) = dropped.checked_sub(1).and_then(|i| window.get(i)) {
            sqlx::query("DELETE FROM session_messages WHERE session_id = ?1 AND seq <= ?2")
                .bind(session_id)
                .bind(*last_dropped)
                .execute(&mut *tx)
                .await
                .map_err(storage("trim window"))?;
        }

        tx.commit().await.map_err(storage("commit"))?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError> {
        let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("lookup session"))?;
        if exists.is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        self.load_messages(session_id).await
    }

    async fn reset(&self, session_id: &str) -> Result<bool, SessionError> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;
        let updated = sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(ts(&Utc::now()))
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("touch session"))?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM session_messages WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("clear messages"))?;
        tx.commit().await.map_err(storage("commit"))?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.channel, s.peer_id, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM session_messages m WHERE m.session_id = s.id) AS message_count
            FROM sessions s
            ORDER BY s.updated_at DESC, s.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage("list sessions"))?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("message_count").map_err(storage("message_count column"))?;
                let created_at: String = row.try_get("created_at").map_err(storage("created_at column"))?;
                let updated_at: String = row.try_get("updated_at").map_err(storage("updated_at column"))?;
                Ok(SessionSummary {
                    id: row.try_get("id").map_err(storage("id column"))?,
                    channel: row.try_get("channel").map_err(storage("channel column"))?,
                    peer_id: row.try_get("peer_id").map_err(storage("peer_id column"))?,
                    message_count: count.max(0) as usize,
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                })
            })
            .collect()
    }
}
