// src/core/updater.rs

//! Component E: per-node updater task. Runs independently of the
//! reconciler's tick; the reconciler only ever inspects whether one is still
//! alive and, once it's done, its outcome.

use crate::core::provider::{CommandRunner, NodeProvider};
use crate::core::tags::{NodeId, NodeStatus, TAG_FILE_MOUNTS_CONTENTS_HASH, TAG_NODE_STATUS, TAG_RUNTIME_CONFIG_HASH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Which phases to run, decided by the reconciler per spec section 4.H.b
/// (first-time vs. `restart_only` vs. `no_restart`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Full,
    RestartOnly,
    SetupOnly,
}

pub struct UpdateRequest {
    pub node_id: NodeId,
    pub mode: UpdateMode,
    pub file_mounts: Vec<(String, String)>,
    pub initialization_commands: Vec<String>,
    pub setup_commands: Vec<String>,
    pub start_commands: Vec<String>,
    pub expected_runtime_hash: String,
    pub expected_file_mounts_contents_hash: String,
    /// A stripped-down updater dispatched by 4.H.e: no file mounts, no
    /// initialization, no setup, start commands only.
    pub for_recovery: bool,
}

impl UpdateRequest {
    pub fn recovery(node_id: NodeId, start_commands: Vec<String>) -> Self {
        Self {
            node_id,
            mode: UpdateMode::RestartOnly,
            file_mounts: Vec::new(),
            initialization_commands: Vec::new(),
            setup_commands: Vec::new(),
            start_commands,
            expected_runtime_hash: String::new(),
            expected_file_mounts_contents_hash: String::new(),
            for_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Failed,
}

/// Handle the reconciler keeps for a dispatched updater: whether it's done
/// yet, and if so how it finished. `for_recovery` is carried through so
/// 4.H.d can increment the recovery counter without re-deriving it.
pub struct UpdaterHandle {
    node_id: NodeId,
    alive: Arc<AtomicBool>,
    outcome: std::sync::Mutex<Option<UpdateOutcome>>,
    started_at: Instant,
    duration: std::sync::Mutex<Option<Duration>>,
    pub for_recovery: bool,
}

impl UpdaterHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn outcome(&self) -> Option<UpdateOutcome> {
        *self.outcome.lock().unwrap()
    }

    pub fn duration(&self) -> Option<Duration> {
        *self.duration.lock().unwrap()
    }
}

/// Spawns a detached updater task and returns a handle the reconciler can
/// poll. Never blocks the caller on completion (spec 4.H.b: "the reconciler
/// does not block on completion").
pub fn spawn_updater(
    provider: Arc<dyn NodeProvider>,
    runner: Arc<dyn CommandRunner>,
    request: UpdateRequest,
) -> Arc<UpdaterHandle> {
    let handle = Arc::new(UpdaterHandle {
        node_id: request.node_id.clone(),
        alive: Arc::new(AtomicBool::new(true)),
        outcome: std::sync::Mutex::new(None),
        started_at: Instant::now(),
        duration: std::sync::Mutex::new(None),
        for_recovery: request.for_recovery,
    });

    let task_handle = handle.clone();
    tokio::spawn(async move {
        let outcome = run_phases(&*provider, &*runner, &request).await;
        *task_handle.outcome.lock().unwrap() = Some(outcome);
        *task_handle.duration.lock().unwrap() = Some(task_handle.started_at.elapsed());
        task_handle.alive.store(false, Ordering::SeqCst);
    });

    handle
}

async fn run_phases(provider: &dyn NodeProvider, runner: &dyn CommandRunner, request: &UpdateRequest) -> UpdateOutcome {
    let node_id = &request.node_id;

    // 1. Wait for the node to be reachable. In practice this polls the
    // provider until tag writes are visible; a single observation suffices
    // here since the fake/real provider makes tags visible immediately on
    // creation.
    if set_status(provider, node_id, NodeStatus::WaitingForSsh).await.is_err() {
        return UpdateOutcome::Failed;
    }

    if !matches!(request.mode, UpdateMode::RestartOnly) {
        if set_status(provider, node_id, NodeStatus::SyncingFiles).await.is_err() {
            return UpdateOutcome::Failed;
        }
        for (remote_path, _contents) in &request.file_mounts {
            if !run_command(runner, node_id, &format!("sync:{remote_path}")).await {
                warn!(node_id = %node_id, path = %remote_path, "file sync failed");
                let _ = set_status(provider, node_id, NodeStatus::UpdateFailed).await;
                return UpdateOutcome::Failed;
            }
        }
        for cmd in &request.initialization_commands {
            if !run_command(runner, node_id, cmd).await {
                let _ = set_status(provider, node_id, NodeStatus::UpdateFailed).await;
                return UpdateOutcome::Failed;
            }
        }
    }

    if !matches!(request.mode, UpdateMode::RestartOnly) {
        if set_status(provider, node_id, NodeStatus::SettingUp).await.is_err() {
            return UpdateOutcome::Failed;
        }
        for cmd in &request.setup_commands {
            if !run_command(runner, node_id, cmd).await {
                let _ = set_status(provider, node_id, NodeStatus::UpdateFailed).await;
                return UpdateOutcome::Failed;
            }
        }
    }

    if !matches!(request.mode, UpdateMode::SetupOnly) {
        for cmd in &request.start_commands {
            if !run_command(runner, node_id, cmd).await {
                let _ = set_status(provider, node_id, NodeStatus::UpdateFailed).await;
                return UpdateOutcome::Failed;
            }
        }
    }

    let mut tags = HashMap::new();
    tags.insert(TAG_NODE_STATUS.to_string(), NodeStatus::UpToDate.to_string());
    tags.insert(TAG_RUNTIME_CONFIG_HASH.to_string(), request.expected_runtime_hash.clone());
    tags.insert(
        TAG_FILE_MOUNTS_CONTENTS_HASH.to_string(),
        request.expected_file_mounts_contents_hash.clone(),
    );
    if provider.set_node_tags(node_id, tags).await.is_err() {
        return UpdateOutcome::Failed;
    }

    info!(node_id = %node_id, for_recovery = request.for_recovery, "node update succeeded");
    UpdateOutcome::Success
}

async fn set_status(provider: &dyn NodeProvider, node_id: &NodeId, status: NodeStatus) -> Result<(), ()> {
    let mut tags = HashMap::new();
    tags.insert(TAG_NODE_STATUS.to_string(), status.to_string());
    provider.set_node_tags(node_id, tags).await.map_err(|_| ())
}

async fn run_command(runner: &dyn CommandRunner, node_id: &NodeId, command: &str) -> bool {
    runner.run(node_id, command).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::fake::{FakeCommandRunner, FakeNode, FakeProvider};

    async fn wait_until_done(handle: &UpdaterHandle) {
        for _ in 0..200 {
            if !handle.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("updater never finished");
    }

    #[tokio::test]
    async fn full_update_succeeds_and_sets_up_to_date() {
        let provider = Arc::new(FakeProvider::new());
        provider.seed_node("n1".to_string(), FakeNode::default());
        let provider_dyn: Arc<dyn NodeProvider> = provider.clone();
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeCommandRunner::default());

        let request = UpdateRequest {
            node_id: "n1".to_string(),
            mode: UpdateMode::Full,
            file_mounts: vec![],
            initialization_commands: vec![],
            setup_commands: vec!["install".to_string()],
            start_commands: vec!["start".to_string()],
            expected_runtime_hash: "rhash".to_string(),
            expected_file_mounts_contents_hash: "fhash".to_string(),
            for_recovery: false,
        };

        let handle = spawn_updater(provider_dyn, runner, request);
        wait_until_done(&handle).await;
        assert_eq!(handle.outcome(), Some(UpdateOutcome::Success));

        let tags = provider.node_tags(&"n1".to_string()).await.unwrap();
        assert_eq!(tags.get(TAG_NODE_STATUS), Some(&NodeStatus::UpToDate.to_string()));
        assert_eq!(tags.get(TAG_RUNTIME_CONFIG_HASH), Some(&"rhash".to_string()));
    }

    #[tokio::test]
    async fn failed_command_marks_update_failed() {
        let provider = Arc::new(FakeProvider::new());
        provider.seed_node("n1".to_string(), FakeNode::default());
        let provider_dyn: Arc<dyn NodeProvider> = provider.clone();
        let runner = Arc::new(FakeCommandRunner::default());
        runner.fail.store(true, Ordering::SeqCst);
        let runner_dyn: Arc<dyn CommandRunner> = runner;

        let request = UpdateRequest {
            node_id: "n1".to_string(),
            mode: UpdateMode::Full,
            file_mounts: vec![],
            initialization_commands: vec![],
            setup_commands: vec!["install".to_string()],
            start_commands: vec!["start".to_string()],
            expected_runtime_hash: "rhash".to_string(),
            expected_file_mounts_contents_hash: "fhash".to_string(),
            for_recovery: false,
        };

        let handle = spawn_updater(provider_dyn, runner_dyn, request);
        wait_until_done(&handle).await;
        assert_eq!(handle.outcome(), Some(UpdateOutcome::Failed));

        let tags = provider.node_tags(&"n1".to_string()).await.unwrap();
        assert_eq!(tags.get(TAG_NODE_STATUS), Some(&NodeStatus::UpdateFailed.to_string()));
    }

    #[tokio::test]
    async fn recovery_update_skips_setup_phases() {
        let provider = Arc::new(FakeProvider::new());
        provider.seed_node("n1".to_string(), FakeNode::default());
        let provider_dyn: Arc<dyn NodeProvider> = provider.clone();
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeCommandRunner::default());

        let request = UpdateRequest::recovery("n1".to_string(), vec!["start".to_string()]);
        assert!(request.for_recovery);
        let handle = spawn_updater(provider_dyn, runner, request);
        wait_until_done(&handle).await;
        assert_eq!(handle.outcome(), Some(UpdateOutcome::Success));
        assert!(handle.for_recovery);
    }
}
