// src/core/launcher.rs

//! Component D: a bounded-capacity FIFO of launch requests, drained by a
//! fixed pool of worker tasks that call the node provider. Mirrors the
//! task-pool-plus-channel shape used for monitor loops elsewhere in this
//! codebase, generalized from one task per request to a fixed worker count
//! pulling off a shared queue.

use crate::core::concurrent_counter::ConcurrentCounter;
use crate::core::event_summarizer::EventSummarizer;
use crate::core::metrics;
use crate::core::provider::NodeProvider;
use crate::core::tags::{NodeTypeName, TAG_LAUNCH_CONFIG_HASH, TAG_NODE_KIND, TAG_NODE_STATUS, TAG_USER_NODE_TYPE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// One unit of launch work: launch `count` nodes of `node_type`, tagged with
/// the launch-config hash frozen at enqueue time.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub node_type: NodeTypeName,
    pub count: u32,
    pub launch_config_hash: String,
}

/// Owns the launch queue and spawns its fixed worker pool. The reconciler
/// holds only a [`LaunchQueueHandle`] (a sender capability), matching the
/// ownership split in section 4's cyclic-reference note: launchers hold a
/// non-owning reference to the provider, and the scaler never blocks on
/// queue backpressure.
pub struct LauncherPool {
    sender: mpsc::Sender<LaunchRequest>,
}

#[derive(Clone)]
pub struct LaunchQueueHandle {
    sender: mpsc::Sender<LaunchRequest>,
}

impl LaunchQueueHandle {
    /// Enqueues a launch request without blocking. If the queue is full the
    /// request is dropped; the next reconciler tick will re-observe the
    /// demand and re-enqueue. The caller (the reconciler) must already have
    /// incremented the pending counter by `request.count` before calling
    /// this; on drop, it is the caller's responsibility to back it out since
    /// no worker will ever see this request.
    pub fn try_enqueue(&self, request: LaunchRequest) -> bool {
        match self.sender.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("launch queue full, dropping request for this tick");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("launch queue closed, dropping request");
                false
            }
        }
    }
}

const QUEUE_CAPACITY: usize = 1_000;

impl LauncherPool {
    /// Spawns `⌈max_concurrent_launches / max_launch_batch⌉` worker tasks
    /// into `tasks`, each pulling from the same bounded channel.
    pub fn spawn(
        tasks: &mut JoinSet<()>,
        provider: Arc<dyn NodeProvider>,
        pending: Arc<ConcurrentCounter>,
        events: Arc<EventSummarizer>,
        max_launch_batch: u32,
        max_concurrent_launches: u32,
    ) -> LaunchQueueHandle {
        let worker_count = max_concurrent_launches.div_ceil(max_launch_batch.max(1)).max(1);
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_id in 0..worker_count {
            let provider = provider.clone();
            let pending = pending.clone();
            let events = events.clone();
            let receiver = receiver.clone();
            let max_launch_batch = max_launch_batch.max(1);
            tasks.spawn(async move {
                loop {
                    let request = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(request) = request else {
                        info!(worker_id, "launch worker shutting down: queue closed");
                        return;
                    };
                    handle_request(&*provider, &pending, &events, request, max_launch_batch).await;
                }
            });
        }

        LaunchQueueHandle { sender }
    }
}

async fn handle_request(
    provider: &dyn NodeProvider,
    pending: &ConcurrentCounter,
    events: &EventSummarizer,
    request: LaunchRequest,
    max_launch_batch: u32,
) {
    let mut remaining = request.count;
    while remaining > 0 {
        let batch = remaining.min(max_launch_batch);
        let mut tags = HashMap::new();
        tags.insert(TAG_NODE_KIND.to_string(), "worker".to_string());
        tags.insert(TAG_USER_NODE_TYPE.to_string(), request.node_type.clone());
        tags.insert(TAG_NODE_STATUS.to_string(), "uninitialized".to_string());
        tags.insert(TAG_LAUNCH_CONFIG_HASH.to_string(), request.launch_config_hash.clone());

        match provider.create_node(&request.node_type, batch, tags).await {
            Ok(created) => {
                metrics::record_nodes_launched(&request.node_type, created.len() as u64);
                events.add(
                    format!("Adding {{}} node(s) of type {}.", request.node_type),
                    created.len() as i64,
                );
            }
            Err(e) => {
                error!(node_type = %request.node_type, error = %e, "node creation failed");
                metrics::record_launch_failure(&request.node_type);
                events.add(format!("Failed to launch {{}} node(s) of type {}.", request.node_type), batch as i64);
            }
        }

        // Whether or not the call succeeded, the slots it was attempting are
        // no longer pending: a failure here is re-observed as unmet demand
        // next tick, not retried in place.
        pending.dec(&request.node_type, batch as i64);
        remaining -= batch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::fake::FakeProvider;

    #[tokio::test]
    async fn launch_request_decrements_pending_on_success() {
        let provider: Arc<dyn NodeProvider> = Arc::new(FakeProvider::new());
        let pending = Arc::new(ConcurrentCounter::new());
        let events = Arc::new(EventSummarizer::new());
        pending.inc("worker", 3);

        let mut tasks = JoinSet::new();
        let handle = LauncherPool::spawn(&mut tasks, provider.clone(), pending.clone(), events.clone(), 5, 5);
        handle.try_enqueue(LaunchRequest {
            node_type: "worker".to_string(),
            count: 3,
            launch_config_hash: "abc123".to_string(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(pending.get("worker"), 0);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn launch_request_splits_into_batches() {
        let provider = Arc::new(FakeProvider::new());
        let provider_dyn: Arc<dyn NodeProvider> = provider.clone();
        let pending = Arc::new(ConcurrentCounter::new());
        let events = Arc::new(EventSummarizer::new());
        pending.inc("worker", 7);

        let mut tasks = JoinSet::new();
        let handle = LauncherPool::spawn(&mut tasks, provider_dyn, pending.clone(), events.clone(), 3, 3);
        handle.try_enqueue(LaunchRequest {
            node_type: "worker".to_string(),
            count: 7,
            launch_config_hash: "abc123".to_string(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(provider.node_count(), 7);
        assert_eq!(pending.get("worker"), 0);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn failed_create_still_decrements_pending() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let provider_dyn: Arc<dyn NodeProvider> = provider;
        let pending = Arc::new(ConcurrentCounter::new());
        let events = Arc::new(EventSummarizer::new());
        pending.inc("worker", 2);

        let mut tasks = JoinSet::new();
        let handle = LauncherPool::spawn(&mut tasks, provider_dyn, pending.clone(), events.clone(), 5, 5);
        handle.try_enqueue(LaunchRequest {
            node_type: "worker".to_string(),
            count: 2,
            launch_config_hash: "abc123".to_string(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(pending.get("worker"), 0);
        tasks.abort_all();
    }
}
