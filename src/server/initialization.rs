// src/server/initialization.rs

//! Builds every long-lived component the control loop needs before the
//! first tick: the provider/command-runner pair, the in-memory telemetry
//! views, the launch queue, and the reconciler itself.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::concurrent_counter::ConcurrentCounter;
use crate::core::event_summarizer::EventSummarizer;
use crate::core::launcher::LauncherPool;
use crate::core::load_metrics::LoadMetrics;
use crate::core::node_tracker::NodeTracker;
use crate::core::provider::{CommandRunner, NodeProvider, ProviderRegistry};
use crate::core::reconciler::Reconciler;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all components before the reconciler's first tick.
pub async fn setup(
    config: Config,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    // A registry even though this process only ever builds one: it's the
    // same cache an embedder running several clusters in-process would
    // share, keyed by provider config plus cluster name rather than reached
    // for through a process-wide global.
    let registry = ProviderRegistry::new();
    let (provider, command_runner) = build_provider(&registry, &config)?;
    let events = Arc::new(EventSummarizer::new());
    let tracker = Arc::new(NodeTracker::default());
    let pending = Arc::new(ConcurrentCounter::new());
    let load_metrics = Arc::new(LoadMetrics::new(config.heartbeat_timeout()));

    let mut launch_workers = JoinSet::new();
    let launch_queue = LauncherPool::spawn(
        &mut launch_workers,
        provider.clone(),
        pending.clone(),
        events.clone(),
        config.max_launch_batch,
        config.max_concurrent_launches,
    );

    let reconciler = Arc::new(Reconciler::new(
        config,
        provider,
        command_runner,
        events,
        tracker,
        pending,
        load_metrics,
        launch_queue,
    ));

    info!("reconciler initialized");

    Ok(ServerContext {
        reconciler,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        launch_workers,
    })
}

#[cfg(feature = "fake-provider")]
fn build_provider(
    registry: &ProviderRegistry,
    config: &Config,
) -> Result<(Arc<dyn NodeProvider>, Arc<dyn CommandRunner>)> {
    use crate::core::provider::fake::{FakeCommandRunner, FakeProvider};

    if config.provider.provider_type != "fake" {
        return Err(anyhow!(
            "unknown provider type '{}': only 'fake' is built into this binary",
            config.provider.provider_type
        ));
    }
    let provider = registry.get_or_create(&config.provider, &config.cluster_name, || Arc::new(FakeProvider::new()));
    Ok((provider, Arc::new(FakeCommandRunner::default())))
}

#[cfg(not(feature = "fake-provider"))]
fn build_provider(
    _registry: &ProviderRegistry,
    config: &Config,
) -> Result<(Arc<dyn NodeProvider>, Arc<dyn CommandRunner>)> {
    Err(anyhow!(
        "no NodeProvider backend compiled in for provider type '{}'; build with the fake-provider feature or link a real backend",
        config.provider.provider_type
    ))
}

fn log_startup_info(config: &Config) {
    info!(
        cluster = %config.cluster_name,
        head_node_type = %config.head_node_type,
        max_workers = config.max_workers,
        "starting fleetscaler control loop"
    );
}
