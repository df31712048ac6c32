//! `relayclaw gateway`: Start the HTTP API server.

use std::sync::Arc;

use relayclaw::Runtime;
use relayclaw::runtime::BoxError;
use relayclaw_config::AppConfig;
use relayclaw_dispatch::DispatchMode;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run(mut config: AppConfig, port: Option<u16>, with_worker: bool) -> Result<(), BoxError> {
    if let Some(port) = port {
        config.gateway.port = port;
    }
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let runtime = Runtime::from_config(config).await?;
    let skills = runtime.spawn_skill_reload();

    println!("🦀 RelayClaw Gateway");
    println!("   Listening: {addr}");
    println!("   Provider:  {} ({})", runtime.conversation.provider().name(), runtime.conversation.provider().model());
    println!("   Dispatch:  {:?}", runtime.mode);
    println!("   Channels:  {}", runtime.channels.list().join(", "));
    println!(
        "   Auth:      {}",
        if runtime.config.gateway.auth_token.as_deref().is_some_and(|t| !t.is_empty()) {
            "bearer token"
        } else {
            "disabled"
        }
    );

    if runtime.mode == DispatchMode::Queued && !with_worker {
        warn!("Queued mode without --with-worker: run `relayclaw worker` to deliver replies");
    }

    let (stop, stopped) = watch::channel(false);
    let worker = with_worker.then(|| {
        info!(concurrency = runtime.config.dispatch.worker_concurrency, "Starting in-process worker");
        tokio::spawn(Arc::new(runtime.worker()).run(stopped))
    });

    let state = Arc::new(runtime.gateway_state());
    relayclaw_gateway::serve(state, &addr, super::ctrl_c()).await?;

    info!("Gateway stopped, shutting down");
    let _ = stop.send(true);
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    if let Some(skills) = skills {
        skills.abort();
    }
    Ok(())
}
