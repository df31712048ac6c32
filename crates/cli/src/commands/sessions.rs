//! `relayclaw sessions`: Inspect and reset stored sessions.

use relayclaw::runtime::BoxError;
use relayclaw_config::AppConfig;
use relayclaw_core::session::{SessionStore, SessionSummary};
use relayclaw_sessions::SqliteSessionStore;

/// Sessions only outlive a process with the SQLite backend.
async fn open_store(config: &AppConfig) -> Result<SqliteSessionStore, BoxError> {
    if config.storage.backend != "sqlite" {
        return Err("storage.backend is \"memory\"; there are no persisted sessions to manage".into());
    }
    let path = &config.storage.db_path;
    let url = if path.starts_with("sqlite:") {
        path.clone()
    } else {
        format!("sqlite://{path}")
    };
    Ok(SqliteSessionStore::new(&url, config.agent.max_history_messages).await?)
}

pub fn format_row(s: &SessionSummary) -> String {
    format!(
        "{:<40} {:>6}  {}",
        s.id,
        s.message_count,
        s.updated_at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub async fn list(config: AppConfig) -> Result<(), BoxError> {
    let store = open_store(&config).await?;
    let sessions = store.list().await?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!("{:<40} {:>6}  {}", "SESSION", "MSGS", "UPDATED (UTC)");
    for s in &sessions {
        println!("{}", format_row(s));
    }
    println!("\n{} session(s)", sessions.len());
    Ok(())
}

pub async fn reset(config: AppConfig, id: &str) -> Result<(), BoxError> {
    let store = open_store(&config).await?;
    if store.reset(id).await? {
        println!("✅ Session '{id}' cleared");
        Ok(())
    } else {
        Err(format!("Session '{id}' not found").into())
    }
}
