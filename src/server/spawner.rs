// src/server/spawner.rs

//! Spawns the server's long-running background tasks: the metrics endpoint
//! and the reconciler's tick loop.

use super::context::ServerContext;
use super::metrics_server;
use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

/// Spawns all critical background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    let metrics_config = ctx.reconciler.config_snapshot().metrics;
    if metrics_config.enabled {
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        let port = metrics_config.port;
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("prometheus metrics server is disabled in the configuration");
    }

    // Bridge the broadcast shutdown fanout into the watch channel the
    // reconciler's run loop selects on.
    let (tick_shutdown_tx, tick_shutdown_rx) = watch::channel(false);
    let mut bridge_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        let _ = bridge_rx.recv().await;
        let _ = tick_shutdown_tx.send(true);
        Ok(())
    });

    let reconciler = ctx.reconciler.clone();
    background_tasks.spawn(async move {
        reconciler
            .run(tick_shutdown_rx)
            .await
            .map_err(|e| anyhow::anyhow!("reconciler loop exited: {e}"))
    });

    info!("all background tasks have been spawned");
    Ok(())
}
