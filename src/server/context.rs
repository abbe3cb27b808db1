// src/server/context.rs

use crate::core::reconciler::Reconciler;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the control loop's main
/// task and its supporting background tasks.
pub struct ServerContext {
    pub reconciler: Arc<Reconciler>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// Keeps the launcher pool's worker tasks alive for the server's
    /// lifetime; their outcome isn't part of the server's own Result.
    pub launch_workers: JoinSet<()>,
}
