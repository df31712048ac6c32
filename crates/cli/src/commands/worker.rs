//! `relayclaw worker`: Consume the job queue until Ctrl+C.

use std::sync::Arc;

use relayclaw::Runtime;
use relayclaw::runtime::BoxError;
use relayclaw_config::AppConfig;
use tokio::sync::watch;
use tracing::info;

pub async fn run(config: AppConfig) -> Result<(), BoxError> {
    if config.dispatch.queue == "memory" {
        return Err("dispatch.queue = \"memory\" is per-process; a standalone worker needs \"sqlite\"".into());
    }

    let runtime = Runtime::from_config(config).await?;
    let skills = runtime.spawn_skill_reload();
    let worker = Arc::new(runtime.worker());

    println!("🦀 RelayClaw Worker");
    println!("   Queue:       {}", runtime.config.dispatch.queue_path);
    println!("   Concurrency: {}", worker.concurrency());
    println!("   Channels:    {}", runtime.channels.list().join(", "));

    let (stop, stopped) = watch::channel(false);
    let running = tokio::spawn(worker.run(stopped));

    super::ctrl_c().await;
    info!("Shutdown requested, waiting for in-flight jobs");
    let _ = stop.send(true);
    running.await?;

    if let Some(skills) = skills {
        skills.abort();
    }
    Ok(())
}
