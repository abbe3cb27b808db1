// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use context::ServerContext;

/// The main server startup function, orchestrating all setup phases and
/// running until a shutdown signal or a background task failure.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    let mut server_context = initialization::setup(config, log_reload_handle).await?;
    spawner::spawn_all(&mut server_context).await?;
    run_until_shutdown(server_context).await
}

/// Waits for Ctrl-C or for any background task to exit, then fans out a
/// shutdown signal and waits for the rest to wind down.
async fn run_until_shutdown(mut ctx: ServerContext) -> Result<()> {
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
            None
        }
        joined = ctx.background_tasks.join_next() => joined,
    };

    let _ = ctx.shutdown_tx.send(());

    if let Some(joined) = outcome {
        report_task_exit(joined);
    }
    while let Some(joined) = ctx.background_tasks.join_next().await {
        report_task_exit(joined);
    }

    // Launcher workers never exit on their own (they block on the shared
    // channel); dropping the JoinSet aborts them.
    drop(ctx.launch_workers);

    info!("shutdown complete");
    Ok(())
}

fn report_task_exit(joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("background task exited with error: {e}"),
        Err(e) => error!("background task panicked: {e}"),
    }
}
