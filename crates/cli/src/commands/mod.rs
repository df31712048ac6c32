pub mod agent;
pub mod config_cmd;
pub mod gateway;
pub mod sessions;
pub mod worker;

/// Resolves when Ctrl+C is pressed.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
