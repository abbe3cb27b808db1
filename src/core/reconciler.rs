// src/core/reconciler.rs

//! Component H: the control loop. Owns every other component and ties them
//! together into the ordered tick described in spec section 4.H
//! (Observe -> Terminate -> Update -> Launch -> Flush).

use crate::config::Config;
use crate::core::concurrent_counter::ConcurrentCounter;
use crate::core::errors::ScalerError;
use crate::core::event_summarizer::EventSummarizer;
use crate::core::hashing::{hash_file_mounts_contents, hash_launch_conf, hash_runtime_conf};
use crate::core::launcher::{LaunchQueueHandle, LaunchRequest};
use crate::core::load_metrics::LoadMetrics;
use crate::core::metrics;
use crate::core::node_tracker::NodeTracker;
use crate::core::provider::{CommandRunner, NodeProvider};
use crate::core::resource_demand_scheduler::{self as scheduler, Resource, SchedulerConfig, SchedulerInputs, WorkerNode};
use crate::core::snapshot::AutoscalerSnapshot;
use crate::core::tags::{NodeId, NodeIp, NodeKind, NodeStatus, NodeTypeName, Tags, TerminationReason};
use crate::core::updater::{self, UpdateMode, UpdateRequest, UpdaterHandle};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// One non-terminated worker, as observed at the start of a tick.
#[derive(Debug, Clone)]
struct WorkerView {
    id: NodeId,
    ip: NodeIp,
    node_type: NodeTypeName,
    status: NodeStatus,
    launch_config_hash: Option<String>,
    runtime_config_hash: Option<String>,
    file_mounts_contents_hash: Option<String>,
}

#[derive(Debug, Default)]
struct TickOutcome {
    terminations: Vec<(NodeId, TerminationReason)>,
}

/// The reconciler's long-lived state. A single instance owns the provider,
/// the launch queue sender, and every tracking structure; it is driven by
/// [`Reconciler::run`] or, in tests, by calling [`Reconciler::tick`] directly.
pub struct Reconciler {
    config: RwLock<Config>,
    provider: Arc<dyn NodeProvider>,
    command_runner: Arc<dyn CommandRunner>,
    events: Arc<EventSummarizer>,
    tracker: Arc<NodeTracker>,
    pending: Arc<ConcurrentCounter>,
    load_metrics: Arc<LoadMetrics>,
    launch_queue: LaunchQueueHandle,
    updaters: SyncMutex<HashMap<NodeId, Arc<UpdaterHandle>>>,
    failed_updates: SyncMutex<HashSet<NodeId>>,
    failure_count: AtomicU32,
    last_snapshot: RwLock<AutoscalerSnapshot>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        provider: Arc<dyn NodeProvider>,
        command_runner: Arc<dyn CommandRunner>,
        events: Arc<EventSummarizer>,
        tracker: Arc<NodeTracker>,
        pending: Arc<ConcurrentCounter>,
        load_metrics: Arc<LoadMetrics>,
        launch_queue: LaunchQueueHandle,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            provider,
            command_runner,
            events,
            tracker,
            pending,
            load_metrics,
            launch_queue,
            updaters: SyncMutex::new(HashMap::new()),
            failed_updates: SyncMutex::new(HashSet::new()),
            failure_count: AtomicU32::new(0),
            last_snapshot: RwLock::new(AutoscalerSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> AutoscalerSnapshot {
        self.last_snapshot.read().clone()
    }

    /// A clone of the live config, e.g. for the metrics server to read the
    /// configured port without holding its own copy.
    pub fn config_snapshot(&self) -> Config {
        self.config.read().clone()
    }

    /// The load-metrics view, for whatever ingestion path feeds it demand
    /// bundles and heartbeats between ticks.
    pub fn load_metrics(&self) -> &Arc<LoadMetrics> {
        &self.load_metrics
    }

    /// Replaces the live config, e.g. after a file watcher detects a change.
    /// Validation already happened in `Config::from_str`/`from_file`; this
    /// just swaps the value the next tick will read.
    pub fn update_config(&self, config: Config) {
        *self.config.write() = config;
    }

    /// Emergency drain: terminates every worker node regardless of
    /// min_workers, idle horizon, or termination protection. Used for
    /// operator-triggered teardown, not called from the regular tick loop.
    pub async fn kill_all_workers(&self) -> Result<(), ScalerError> {
        let ids = self.provider.non_terminated_nodes(&HashMap::new()).await?;

        let mut to_terminate = Vec::new();
        for id in ids {
            let tags = Tags(self.provider.node_tags(&id).await?);
            if tags.kind() == Some(NodeKind::Worker) {
                to_terminate.push(id);
            }
        }
        if to_terminate.is_empty() {
            return Ok(());
        }
        self.drain_gracefully(&to_terminate).await;
        self.provider.terminate_nodes(&to_terminate).await?;
        for id in &to_terminate {
            self.tracker.untrack(id);
            metrics::record_termination(TerminationReason::KilledByOperator.as_str());
        }
        self.events.add(format!("Killed {} worker node(s) on operator request.", to_terminate.len()), 1);
        warn!(count = to_terminate.len(), "killed all worker nodes on operator request");
        Ok(())
    }

    /// Drives ticks on `update_interval_s`, coalescing so a slow tick never
    /// queues up a backlog (`interval`'s default `Burst` behavior already
    /// skips missed ticks, matching the coalescing requirement). Stops when
    /// `shutdown` is signaled, or returns an error once `max_failures` is
    /// exceeded.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ScalerError> {
        let period = self.config.read().update_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_one_tick().await {
                        error!(error = %e, "reconciler tick aborted: max_failures exceeded");
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler received shutdown signal, stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs exactly one tick, applying the failure-counting policy from
    /// section 7 around it.
    pub async fn run_one_tick(&self) -> Result<(), ScalerError> {
        let started = Instant::now();
        match self.tick().await {
            Ok(()) => {
                metrics::LAST_TICK_SUCCESS.set(1.0);
            }
            Err(e) => {
                metrics::LAST_TICK_SUCCESS.set(0.0);
                if e.counts_against_max_failures() {
                    metrics::TICK_FAILURES_TOTAL.inc();
                    let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let max_failures = self.config.read().max_failures;
                    if failures > max_failures {
                        return Err(e);
                    }
                }
                warn!(error = %e, "reconciler tick failed, continuing");
            }
        }
        metrics::TICK_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn tick(&self) -> Result<(), ScalerError> {
        let config = self.config.read().clone();

        // 2. Observe.
        let (workers, unmanaged_count) = self.observe(&config).await?;

        let active_ips: HashSet<NodeIp> = workers
            .iter()
            .filter(|w| self.load_metrics.is_active(&w.ip))
            .map(|w| w.ip.clone())
            .collect();
        self.load_metrics.prune_active_ips(&active_ips);

        // 3. Terminate for config constraints.
        let outcome = self.terminate_for_config_constraints(&config, &workers).await;
        let terminated_ids: HashSet<NodeId> = outcome.terminations.iter().map(|(id, _)| id.clone()).collect();
        let workers: Vec<WorkerView> = workers.into_iter().filter(|w| !terminated_ids.contains(&w.id)).collect();

        if config.provider.disable_node_updaters {
            // 4. Updaters disabled: heartbeat-only unhealth, then stop.
            self.terminate_unhealthy_by_heartbeat(&config, &workers).await;
        } else {
            // 5. Full updater lifecycle.
            self.process_completed_updaters(&config, &workers).await;
            self.dispatch_updaters(&config, &workers).await;
            self.attempt_recovery(&config, &workers).await;
        }

        // 6. Plan and dispatch launches.
        self.plan_and_dispatch_launches(&config, &workers).await?;

        // 7. Snapshot, metrics, flush.
        self.publish_snapshot(&workers, unmanaged_count);
        let prefix = config.log_prefix();
        info!("{}{}", prefix, self.last_snapshot.read().info_string());
        for line in self.events.flush() {
            info!("{}{}", prefix, line);
        }

        Ok(())
    }

    async fn observe(&self, config: &Config) -> Result<(Vec<WorkerView>, usize), ScalerError> {
        let ids = self.provider.non_terminated_nodes(&HashMap::new()).await?;

        let mut workers = Vec::new();
        let mut unmanaged_count = 0usize;

        for id in ids {
            let raw_tags = match self.provider.node_tags(&id).await {
                Ok(t) => t,
                Err(_) => continue,
            };
            let tags = Tags(raw_tags);
            if !tags.is_fully_tagged() {
                // Creation and tagging are non-atomic; skip until complete.
                continue;
            }
            match tags.kind() {
                Some(NodeKind::Unmanaged) => unmanaged_count += 1,
                Some(NodeKind::Head) => {}
                Some(NodeKind::Worker) => {
                    let Some(node_type) = tags.user_node_type() else { continue };
                    let ip = match self.provider.internal_ip(&id).await {
                        Ok(ip) => ip,
                        Err(_) => continue,
                    };
                    let status = tags.status().unwrap_or(NodeStatus::Uninitialized);
                    self.tracker.track(id.clone(), ip.clone(), node_type.to_string());
                    workers.push(WorkerView {
                        id,
                        ip,
                        node_type: node_type.to_string(),
                        status,
                        launch_config_hash: tags.launch_config_hash().map(str::to_string),
                        runtime_config_hash: tags.runtime_config_hash().map(str::to_string),
                        file_mounts_contents_hash: tags.file_mounts_contents_hash().map(str::to_string),
                    });
                }
                None => continue,
            }
        }

        let _ = config;
        Ok((workers, unmanaged_count))
    }

    fn launch_config_ok(&self, config: &Config, worker: &WorkerView) -> bool {
        if config.provider.disable_launch_config_check {
            return true;
        }
        let Some(entry) = config.available_node_types.get(&worker.node_type) else {
            return false;
        };
        let expected = hash_launch_conf(&entry.node_config, &config.auth);
        worker.launch_config_hash.as_deref() == Some(expected.as_str())
    }

    fn runtime_hash(&self, config: &Config) -> String {
        let mut mount_paths: Vec<String> = config.file_mounts.keys().cloned().collect();
        mount_paths.sort();
        hash_runtime_conf(
            &mount_paths,
            &config.cluster_synced_files,
            &config.worker_setup_commands,
            &config.worker_start_commands,
            &(),
        )
    }

    /// The hash of the actual synced file contents, present only while
    /// continuous sync is enabled (spec section 3); `None` otherwise, since
    /// there is then nothing to compare a node's tag against.
    fn file_mounts_contents_hash(&self, config: &Config) -> Option<String> {
        if !config.file_mounts_sync_continuously {
            return None;
        }
        let resolved = config.resolve_file_mounts().ok()?;
        let mut entries: Vec<(String, String)> = resolved.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut contents = Vec::with_capacity(entries.len());
        for (remote_path, local_path) in entries {
            contents.push((remote_path, std::fs::read(&local_path).ok()?));
        }
        Some(hash_file_mounts_contents(&contents))
    }

    /// Section 4.H.a.
    async fn terminate_for_config_constraints(&self, config: &Config, workers: &[WorkerView]) -> TickOutcome {
        let last_used = self.load_metrics.last_used_time_by_ip();
        let horizon_secs = 60 * config.idle_timeout_minutes;

        let mut sorted: Vec<&WorkerView> = workers.iter().collect();
        sorted.sort_by(|a, b| mru_order(a, b, &last_used));

        let request_resources = self.load_metrics.resource_requests();
        let protected = if request_resources.is_empty() {
            HashSet::new()
        } else {
            compute_protected_set(&sorted, &request_resources, config)
        };

        let node_type_counts_cfg = config.scheduler_node_types();
        let mut counts_so_far: HashMap<NodeTypeName, u32> = HashMap::new();
        let mut to_terminate: Vec<(NodeId, TerminationReason)> = Vec::new();
        let mut eligible_for_extra: Vec<NodeId> = Vec::new();

        for worker in &sorted {
            let decision = keep_or_terminate(&worker.node_type, &counts_so_far, &node_type_counts_cfg);
            match decision {
                KeepOrTerminate::Terminate(reason) => {
                    to_terminate.push((worker.id.clone(), reason));
                    continue;
                }
                KeepOrTerminate::Keep if self.launch_config_ok(config, worker) => {
                    *counts_so_far.entry(worker.node_type.clone()).or_insert(0) += 1;
                    continue;
                }
                KeepOrTerminate::DecideLater if protected.contains(&worker.id) && self.launch_config_ok(config, worker) => {
                    *counts_so_far.entry(worker.node_type.clone()).or_insert(0) += 1;
                    continue;
                }
                _ => {}
            }

            let is_idle = last_used
                .get(&worker.ip)
                .map(|t| t.elapsed().as_secs() >= horizon_secs)
                .unwrap_or(false)
                && horizon_secs > 0;
            if is_idle {
                to_terminate.push((worker.id.clone(), TerminationReason::Idle));
            } else if !self.launch_config_ok(config, worker) {
                to_terminate.push((worker.id.clone(), TerminationReason::Outdated));
            } else {
                *counts_so_far.entry(worker.node_type.clone()).or_insert(0) += 1;
                eligible_for_extra.push(worker.id.clone());
            }
        }

        let already_terminating = to_terminate.len();
        let surplus = workers.len() as i64 - already_terminating as i64 - config.max_workers as i64;
        if surplus > 0 {
            let mut surplus = surplus as usize;
            if surplus > eligible_for_extra.len() {
                warn!(
                    surplus,
                    eligible = eligible_for_extra.len(),
                    "trying to terminate more nodes than are safe to terminate; config is likely inconsistent"
                );
                surplus = eligible_for_extra.len();
            }
            let start = eligible_for_extra.len() - surplus;
            for id in &eligible_for_extra[start..] {
                to_terminate.push((id.clone(), TerminationReason::MaxWorkers));
            }
        }

        if !to_terminate.is_empty() {
            let ids: Vec<NodeId> = to_terminate.iter().map(|(id, _)| id.clone()).collect();
            self.drain_gracefully(&ids).await;
            if let Err(e) = self.provider.terminate_nodes(&ids).await {
                error!(error = %e, "batch termination call failed");
            }
            for (id, reason) in &to_terminate {
                self.tracker.untrack(id);
                metrics::record_termination(reason.as_str());
                self.events.add(format!("Terminating {{}} node(s), reason: {reason}.", reason = reason.as_str()), 1);
            }
        }

        TickOutcome { terminations: to_terminate }
    }

    /// No-op by default; a real deployment would drain workloads off a node
    /// before handing it to the provider for termination.
    async fn drain_gracefully(&self, _ids: &[NodeId]) {}

    async fn terminate_unhealthy_by_heartbeat(&self, config: &Config, workers: &[WorkerView]) {
        let mut to_terminate = Vec::new();
        for worker in workers {
            if self.is_alive_by_heartbeat(worker) {
                self.load_metrics.mark_active(&worker.ip);
            } else {
                to_terminate.push(worker.id.clone());
            }
        }
        if to_terminate.is_empty() {
            return;
        }
        self.drain_gracefully(&to_terminate).await;
        if let Err(e) = self.provider.terminate_nodes(&to_terminate).await {
            error!(error = %e, "batch termination call failed");
        }
        for id in &to_terminate {
            self.tracker.untrack(id);
            metrics::record_termination(TerminationReason::LostContactWithNode.as_str());
            self.events.add("Terminating {} node(s), reason: lost contact with node.".to_string(), 1);
        }
    }

    fn is_alive_by_heartbeat(&self, worker: &WorkerView) -> bool {
        if self.load_metrics.is_active(&worker.ip) {
            return true;
        }
        if !self.load_metrics.has_heartbeat(&worker.ip) && worker.status == NodeStatus::UpToDate {
            // Grace period on first observation.
            return true;
        }
        false
    }

    /// Section 4.H.b.
    async fn dispatch_updaters(&self, config: &Config, workers: &[WorkerView]) {
        let runtime_hash = self.runtime_hash(config);
        let file_mounts_hash = self.file_mounts_contents_hash(config);
        for worker in workers {
            if !self.should_update(config, worker, &runtime_hash, file_mounts_hash.as_deref()) {
                continue;
            }
            let mode = if config.restart_only {
                UpdateMode::RestartOnly
            } else if config.no_restart && worker.status == NodeStatus::UpToDate {
                UpdateMode::SetupOnly
            } else {
                UpdateMode::Full
            };

            let request = UpdateRequest {
                node_id: worker.id.clone(),
                mode,
                file_mounts: config.file_mounts.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                initialization_commands: Vec::new(),
                setup_commands: config.worker_setup_commands.clone(),
                start_commands: config.worker_start_commands.clone(),
                expected_runtime_hash: runtime_hash.clone(),
                expected_file_mounts_contents_hash: file_mounts_hash.clone().unwrap_or_default(),
                for_recovery: false,
            };
            let handle = updater::spawn_updater(self.provider.clone(), self.command_runner.clone(), request);
            self.updaters.lock().insert(worker.id.clone(), handle);
        }
    }

    fn can_update(&self, config: &Config, worker: &WorkerView) -> bool {
        if config.provider.disable_node_updaters {
            return false;
        }
        if self.updaters.lock().get(&worker.id).map(|h| h.is_alive()).unwrap_or(false) {
            return false;
        }
        if !self.launch_config_ok(config, worker) {
            return false;
        }
        if self.failed_updates.lock().contains(&worker.id) {
            return false;
        }
        true
    }

    fn should_update(
        &self,
        config: &Config,
        worker: &WorkerView,
        runtime_hash: &str,
        file_mounts_hash: Option<&str>,
    ) -> bool {
        if !self.can_update(config, worker) {
            return false;
        }
        if worker.status != NodeStatus::UpToDate {
            return true;
        }
        !self.files_up_to_date(worker, runtime_hash, file_mounts_hash)
    }

    /// Whether `worker`'s tagged runtime/file-mounts hashes already match
    /// the current config, so an otherwise-`up-to-date` node that drifted
    /// (new setup/start commands, changed synced files) is caught.
    fn files_up_to_date(&self, worker: &WorkerView, runtime_hash: &str, file_mounts_hash: Option<&str>) -> bool {
        if worker.runtime_config_hash.as_deref() != Some(runtime_hash) {
            return false;
        }
        match file_mounts_hash {
            Some(expected) => worker.file_mounts_contents_hash.as_deref() == Some(expected),
            None => true,
        }
    }

    /// Section 4.H.d.
    async fn process_completed_updaters(&self, _config: &Config, workers: &[WorkerView]) {
        let worker_ids: HashSet<NodeId> = workers.iter().map(|w| w.id.clone()).collect();
        let completed: Vec<(NodeId, Arc<UpdaterHandle>)> = {
            let updaters = self.updaters.lock();
            updaters
                .iter()
                .filter(|(_, h)| !h.is_alive())
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect()
        };

        let mut to_terminate = Vec::new();
        for (id, handle) in &completed {
            match handle.outcome() {
                Some(updater::UpdateOutcome::Success) => {
                    metrics::UPDATES_SUCCEEDED_TOTAL.inc();
                    if let Some(worker) = workers.iter().find(|w| &w.id == id) {
                        self.load_metrics.mark_active(&worker.ip);
                    }
                    if handle.for_recovery {
                        metrics::RECOVERIES_TOTAL.inc();
                    }
                }
                Some(updater::UpdateOutcome::Failed) | None => {
                    metrics::UPDATES_FAILED_TOTAL.inc();
                    self.failed_updates.lock().insert(id.clone());
                    if worker_ids.contains(id) {
                        to_terminate.push(id.clone());
                    }
                    self.tracker.untrack(id);
                }
            }
        }

        if !to_terminate.is_empty() {
            self.drain_gracefully(&to_terminate).await;
            if let Err(e) = self.provider.terminate_nodes(&to_terminate).await {
                error!(error = %e, "batch termination of failed-update nodes failed");
            }
            for id in &to_terminate {
                metrics::record_termination(TerminationReason::LaunchFailed.as_str());
            }
        }

        let mut updaters = self.updaters.lock();
        for (id, _) in &completed {
            updaters.remove(id);
        }
    }

    /// Section 4.H.e.
    async fn attempt_recovery(&self, config: &Config, workers: &[WorkerView]) {
        for worker in workers {
            if !self.can_update(config, worker) {
                continue;
            }
            if self.is_alive_by_heartbeat(worker) {
                continue;
            }
            let request = UpdateRequest::recovery(worker.id.clone(), config.worker_start_commands.clone());
            let handle = updater::spawn_updater(self.provider.clone(), self.command_runner.clone(), request);
            self.updaters.lock().insert(worker.id.clone(), handle);
        }
    }

    /// Section 4.F, driven by this tick's observations.
    async fn plan_and_dispatch_launches(&self, config: &Config, workers: &[WorkerView]) -> Result<(), ScalerError> {
        let scheduler_config = SchedulerConfig {
            available_node_types: config.scheduler_node_types(),
            max_workers: config.max_workers,
            head_node_type: config.head_node_type.clone(),
            upscaling_speed: config.upscaling_speed,
        };

        let scheduler_workers: Vec<WorkerNode> = workers
            .iter()
            .map(|w| WorkerNode {
                id: w.id.clone(),
                node_type: w.node_type.clone(),
                ip: Some(w.ip.clone()),
            })
            .collect();

        let pending_breakdown = self.pending.breakdown();
        let demands = self.load_metrics.resource_demands();
        let utilization_by_ip = self.load_metrics.resource_utilization();
        let static_resources_by_ip = self.load_metrics.static_node_resources_by_ip();
        let requests = self.load_metrics.resource_requests();

        let inputs = SchedulerInputs {
            workers: &scheduler_workers,
            pending_launches: &pending_breakdown,
            demands: &demands,
            utilization_by_ip: &utilization_by_ip,
            static_resources_by_ip: &static_resources_by_ip,
            resource_requests: &requests,
        };

        let output = scheduler::plan_launches(&scheduler_config, &inputs);

        for bundle in &output.unfulfilled {
            let key = format!("unfulfilled:{:?}", bundle.bundle);
            let label = if bundle.feasible { "pending" } else { "infeasible" };
            metrics::UNFULFILLED_BUNDLES.with_label_values(&[label]).inc();
            self.events.add_once_per_interval(
                format!("Demand bundle {:?} is {label}.", bundle.bundle),
                key,
                Duration::from_secs(30),
            );
        }

        let launch_config_hashes: HashMap<NodeTypeName, String> = config
            .available_node_types
            .iter()
            .map(|(name, entry)| (name.clone(), hash_launch_conf(&entry.node_config, &config.auth)))
            .collect();

        for (node_type, count) in &output.launches {
            if *count == 0 {
                continue;
            }
            self.pending.inc(node_type, *count as i64);
            let request = LaunchRequest {
                node_type: node_type.clone(),
                count: *count,
                launch_config_hash: launch_config_hashes.get(node_type).cloned().unwrap_or_default(),
            };
            if !self.launch_queue.try_enqueue(request) {
                // Dropped: back out the optimistic pending increment so the
                // next tick re-observes the true demand instead of
                // under-counting forever.
                self.pending.dec(node_type, *count as i64);
            }
        }

        Ok(())
    }

    fn publish_snapshot(&self, workers: &[WorkerView], _unmanaged_count: usize) {
        let mut builder = AutoscalerSnapshot::builder();
        for worker in workers {
            let is_active = self.load_metrics.is_active(&worker.ip);
            builder.classify(worker.node_type.clone(), worker.ip.clone(), worker.status, is_active);
        }
        builder.set_pending_launches(self.pending.breakdown().into_iter().map(|(k, v)| (k, v.max(0) as u32)).collect());

        let live_ids: HashSet<NodeId> = workers.iter().map(|w| w.id.clone()).collect();
        let failed = self.tracker.get_all_failed_node_info(&live_ids);
        builder.set_failed(failed);

        let snapshot = builder.build();

        // Gauges reflect this tick's counts exactly, including types that
        // dropped to zero, since `set` overwrites rather than accumulates.
        for cfg_type in self.config.read().available_node_types.keys() {
            metrics::ACTIVE_NODES.with_label_values(&[cfg_type.as_str()]).set(0.0);
            metrics::PENDING_LAUNCHES.with_label_values(&[cfg_type.as_str()]).set(0.0);
        }
        for (node_type, count) in &snapshot.active_by_type {
            metrics::ACTIVE_NODES.with_label_values(&[node_type.as_str()]).set(*count as f64);
        }
        for (node_type, count) in &snapshot.pending_launches {
            metrics::PENDING_LAUNCHES.with_label_values(&[node_type.as_str()]).set(*count as f64);
        }

        let mut pending_by_type: HashMap<NodeTypeName, u32> = HashMap::new();
        for p in &snapshot.pending {
            *pending_by_type.entry(p.node_type.clone()).or_insert(0) += 1;
        }
        for (node_type, count) in &pending_by_type {
            metrics::PENDING_NODES.with_label_values(&[node_type.as_str()]).set(*count as f64);
        }
        metrics::FAILED_NODES.set(snapshot.failed.len() as f64);

        *self.last_snapshot.write() = snapshot;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepOrTerminate {
    Keep,
    Terminate(TerminationReason),
    DecideLater,
}

fn keep_or_terminate(
    node_type: &str,
    counts_so_far: &HashMap<NodeTypeName, u32>,
    available_node_types: &HashMap<NodeTypeName, crate::core::resource_demand_scheduler::NodeTypeConfig>,
) -> KeepOrTerminate {
    let Some(cfg) = available_node_types.get(node_type) else {
        return KeepOrTerminate::Terminate(TerminationReason::NotInAvailableNodeTypes);
    };
    let new_count = counts_so_far.get(node_type).copied().unwrap_or(0) + 1;
    if new_count <= cfg.min_workers.min(cfg.max_workers) {
        return KeepOrTerminate::Keep;
    }
    if new_count > cfg.max_workers {
        return KeepOrTerminate::Terminate(TerminationReason::MaxWorkersPerType);
    }
    KeepOrTerminate::DecideLater
}

fn mru_order(a: &WorkerView, b: &WorkerView, last_used: &HashMap<NodeIp, Instant>) -> std::cmp::Ordering {
    match (last_used.get(&a.ip), last_used.get(&b.ip)) {
        (Some(x), Some(y)) => y.cmp(x).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

/// Mirrors `bin_pack_residual`, but also records which MRU-ordered workers
/// absorbed a request bundle, since those must be protected from
/// termination (spec section 4.H.a).
fn compute_protected_set(sorted_workers: &[&WorkerView], requests: &[Resource], config: &Config) -> HashSet<NodeId> {
    let node_types = config.scheduler_node_types();
    let mut nodes: Vec<Resource> = sorted_workers
        .iter()
        .map(|w| node_types.get(&w.node_type).map(|c| c.resources.clone()).unwrap_or_default())
        .collect();
    let mut protected = HashSet::new();

    for bundle in requests {
        if let Some(idx) = nodes.iter().position(|n| scheduler::dominates(n, bundle)) {
            for (k, v) in bundle {
                let entry = nodes[idx].entry(k.clone()).or_insert(0.0);
                *entry -= v;
            }
            protected.insert(sorted_workers[idx].id.clone());
        }
    }

    protected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::fake::{FakeCommandRunner, FakeNode, FakeProvider};
    use crate::core::tags::{TAG_LAUNCH_CONFIG_HASH, TAG_NODE_KIND, TAG_NODE_STATUS, TAG_USER_NODE_TYPE};

    fn minimal_config(min_workers: u32, max_workers: u32, type_max_workers: u32) -> Config {
        let toml = format!(
            r#"
            cluster_name = "test"
            head_node_type = "head"
            max_workers = {max_workers}
            upscaling_speed = 1.0

            [available_node_types.head]
            min_workers = 0
            max_workers = 1

            [available_node_types.w]
            min_workers = {min_workers}
            max_workers = {type_max_workers}
            [available_node_types.w.resources]
            CPU = 4.0
            "#
        );
        Config::from_str(&toml).unwrap()
    }

    fn new_reconciler(config: Config, provider: Arc<FakeProvider>) -> Reconciler {
        let provider_dyn: Arc<dyn NodeProvider> = provider;
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeCommandRunner::default());
        let events = Arc::new(EventSummarizer::new());
        let tracker = Arc::new(NodeTracker::new(100));
        let pending = Arc::new(ConcurrentCounter::new());
        let load_metrics = Arc::new(LoadMetrics::new(Duration::from_secs(config.heartbeat_timeout_s)));
        let mut tasks = tokio::task::JoinSet::new();
        let launch_queue = crate::core::launcher::LauncherPool::spawn(
            &mut tasks,
            provider_dyn.clone(),
            pending.clone(),
            events.clone(),
            config.max_launch_batch,
            config.max_concurrent_launches,
        );
        std::mem::forget(tasks);
        Reconciler::new(config, provider_dyn, runner, events, tracker, pending, load_metrics, launch_queue)
    }

    #[tokio::test]
    async fn s1_min_workers_fill() {
        let config = minimal_config(2, 10, 10);
        let provider = Arc::new(FakeProvider::new());
        let reconciler = new_reconciler(config, provider.clone());

        reconciler.run_one_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.node_count(), 2);
    }

    #[tokio::test]
    async fn s6_infeasible_bundle_recorded_in_status() {
        let config = minimal_config(0, 10, 10);
        let provider = Arc::new(FakeProvider::new());
        let reconciler = new_reconciler(config, provider.clone());
        reconciler.load_metrics.set_resource_demands(vec![Resource::from([("GPU".to_string(), 8.0)])]);

        reconciler.run_one_tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.node_count(), 0);
    }

    #[tokio::test]
    async fn s5_heartbeat_loss_with_updaters_disabled() {
        let toml = r#"
            cluster_name = "test"
            head_node_type = "head"
            max_workers = 5
            heartbeat_timeout_s = 1

            [provider]
            disable_node_updaters = true

            [available_node_types.head]
            min_workers = 0
            max_workers = 1
            [available_node_types.w]
            min_workers = 0
            max_workers = 5
            [available_node_types.w.resources]
            CPU = 4.0
        "#;
        let config = Config::from_str(toml).unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.seed_node(
            "n1".to_string(),
            FakeNode {
                tags: HashMap::from([
                    (TAG_NODE_KIND.to_string(), "worker".to_string()),
                    (TAG_USER_NODE_TYPE.to_string(), "w".to_string()),
                    (TAG_NODE_STATUS.to_string(), "up-to-date".to_string()),
                    (TAG_LAUNCH_CONFIG_HASH.to_string(), "irrelevant".to_string()),
                ]),
                ip: "10.0.0.5".to_string(),
                terminated: false,
            },
        );
        let reconciler = new_reconciler(config, provider.clone());

        // First tick: grace period on first observation, node survives and is marked active.
        reconciler.run_one_tick().await.unwrap();
        assert_eq!(provider.node_count(), 1);

        // Let the heartbeat timeout lapse without ever heartbeating again.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        reconciler.run_one_tick().await.unwrap();
        assert_eq!(provider.node_count(), 0);
    }

    #[test]
    fn keep_or_terminate_respects_min_and_max() {
        let mut types = HashMap::new();
        types.insert(
            "w".to_string(),
            crate::core::resource_demand_scheduler::NodeTypeConfig {
                resources: Resource::new(),
                min_workers: 1,
                max_workers: 2,
            },
        );
        let counts = HashMap::new();
        assert_eq!(keep_or_terminate("w", &counts, &types), KeepOrTerminate::Keep);
        assert_eq!(
            keep_or_terminate("missing", &counts, &types),
            KeepOrTerminate::Terminate(TerminationReason::NotInAvailableNodeTypes)
        );

        let mut at_max = HashMap::new();
        at_max.insert("w".to_string(), 2u32);
        assert_eq!(
            keep_or_terminate("w", &at_max, &types),
            KeepOrTerminate::Terminate(TerminationReason::MaxWorkersPerType)
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let config = minimal_config(0, 1, 1);
        let provider = Arc::new(FakeProvider::new());
        let reconciler = Arc::new(new_reconciler(config, provider));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconciler.run(rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }
}
