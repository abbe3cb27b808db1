// src/config.rs

//! Manages cluster configuration: loading, resolving, and validation.

use crate::core::resource_demand_scheduler::{NodeTypeConfig, Resource};
use crate::core::tags::NodeTypeName;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tracing::warn;

/// `provider` block: backend selection plus the two escape hatches an
/// operator can flip when they own node setup or launch-config drift
/// themselves.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProviderConfig {
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,
    #[serde(default)]
    pub disable_node_updaters: bool,
    #[serde(default)]
    pub disable_launch_config_check: bool,
    /// Provider-specific settings the core never interprets; kept so
    /// unknown keys round-trip rather than failing to parse.
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

fn default_provider_type() -> String {
    "fake".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DockerConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    /// Per-node-type overrides, merged over the top-level docker block.
    #[serde(default)]
    pub worker_image: HashMap<NodeTypeName, String>,
}

/// Raw, pre-validation shape of one `available_node_types` entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeTypeEntry {
    /// `BTreeMap` rather than `HashMap` so its key order, and therefore its
    /// serialized bytes, are stable across process restarts — this feeds
    /// `hash_launch_conf` directly.
    #[serde(default)]
    pub node_config: std::collections::BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub resources: Resource,
    #[serde(default)]
    pub min_workers: u32,
    #[serde(default = "default_type_max_workers")]
    pub max_workers: u32,
}

fn default_type_max_workers() -> u32 {
    u32::MAX
}

impl From<NodeTypeEntry> for NodeTypeConfig {
    fn from(entry: NodeTypeEntry) -> Self {
        NodeTypeConfig {
            resources: entry.resources,
            min_workers: entry.min_workers,
            max_workers: entry.max_workers,
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    cluster_name: String,
    #[serde(default)]
    provider: ProviderConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    docker: DockerConfig,
    available_node_types: HashMap<NodeTypeName, NodeTypeEntry>,
    head_node_type: NodeTypeName,
    #[serde(default = "default_max_workers")]
    max_workers: u32,
    #[serde(default = "default_idle_timeout_minutes")]
    idle_timeout_minutes: u64,
    #[serde(default = "default_upscaling_speed")]
    upscaling_speed: f64,
    #[serde(default)]
    file_mounts: HashMap<String, String>,
    #[serde(default)]
    cluster_synced_files: Vec<String>,
    #[serde(default)]
    file_mounts_sync_continuously: bool,
    #[serde(default)]
    worker_setup_commands: Vec<String>,
    #[serde(default)]
    worker_start_commands: Vec<String>,
    #[serde(default)]
    restart_only: bool,
    #[serde(default)]
    no_restart: bool,
    #[serde(default = "default_max_launch_batch")]
    max_launch_batch: u32,
    #[serde(default = "default_max_concurrent_launches")]
    max_concurrent_launches: u32,
    #[serde(default = "default_max_failures")]
    max_failures: u32,
    #[serde(default = "default_update_interval_s")]
    update_interval_s: u64,
    #[serde(default = "default_heartbeat_timeout_s")]
    heartbeat_timeout_s: u64,
    #[serde(default)]
    metrics: MetricsConfig,
    /// Prefixes every reconciler log line with `[cluster_name]`, for
    /// operators running several scalers in one process.
    #[serde(default)]
    prefix_cluster_info: bool,
}

fn default_max_workers() -> u32 {
    2
}
fn default_idle_timeout_minutes() -> u64 {
    5
}
fn default_upscaling_speed() -> f64 {
    1.0
}
fn default_max_launch_batch() -> u32 {
    5
}
fn default_max_concurrent_launches() -> u32 {
    10
}
fn default_max_failures() -> u32 {
    5
}
fn default_update_interval_s() -> u64 {
    5
}
fn default_heartbeat_timeout_s() -> u64 {
    30
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

fn expand_home(path: &str, home: Option<&str>) -> String {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => format!("{home}/{rest}"),
        _ if path == "~" => home.unwrap_or(path).to_string(),
        _ => path.to_string(),
    }
}

/// Represents the final, validated, and resolved cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    pub provider: ProviderConfig,
    pub auth: AuthConfig,
    pub docker: DockerConfig,
    pub available_node_types: HashMap<NodeTypeName, NodeTypeEntry>,
    pub head_node_type: NodeTypeName,
    pub max_workers: u32,
    pub idle_timeout_minutes: u64,
    pub upscaling_speed: f64,
    pub file_mounts: HashMap<String, String>,
    pub cluster_synced_files: Vec<String>,
    pub file_mounts_sync_continuously: bool,
    pub worker_setup_commands: Vec<String>,
    pub worker_start_commands: Vec<String>,
    pub restart_only: bool,
    pub no_restart: bool,
    pub max_launch_batch: u32,
    pub max_concurrent_launches: u32,
    pub max_failures: u32,
    pub update_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub prefix_cluster_info: bool,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse cluster config TOML")?;

        let config = Config {
            cluster_name: raw.cluster_name,
            provider: raw.provider,
            auth: raw.auth,
            docker: raw.docker,
            available_node_types: raw.available_node_types,
            head_node_type: raw.head_node_type,
            max_workers: raw.max_workers,
            idle_timeout_minutes: raw.idle_timeout_minutes,
            upscaling_speed: raw.upscaling_speed,
            file_mounts: raw.file_mounts,
            cluster_synced_files: raw.cluster_synced_files,
            file_mounts_sync_continuously: raw.file_mounts_sync_continuously,
            worker_setup_commands: raw.worker_setup_commands,
            worker_start_commands: raw.worker_start_commands,
            restart_only: raw.restart_only,
            no_restart: raw.no_restart,
            max_launch_batch: raw.max_launch_batch,
            max_concurrent_launches: raw.max_concurrent_launches,
            max_failures: raw.max_failures,
            update_interval_s: raw.update_interval_s,
            heartbeat_timeout_s: raw.heartbeat_timeout_s,
            metrics: raw.metrics,
            prefix_cluster_info: raw.prefix_cluster_info,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(anyhow!("cluster_name cannot be empty"));
        }
        if !self.available_node_types.contains_key(&self.head_node_type) {
            return Err(anyhow!(
                "head_node_type '{}' is not in available_node_types",
                self.head_node_type
            ));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers cannot be 0"));
        }
        if self.max_launch_batch == 0 {
            return Err(anyhow!("max_launch_batch cannot be 0"));
        }
        if self.max_concurrent_launches == 0 {
            return Err(anyhow!("max_concurrent_launches cannot be 0"));
        }
        if !(0.0..=100.0).contains(&self.upscaling_speed) {
            warn!(
                "unusual upscaling_speed {}; expected a small positive multiplier",
                self.upscaling_speed
            );
        }
        for (name, entry) in &self.available_node_types {
            if entry.min_workers > entry.max_workers {
                return Err(anyhow!(
                    "node type '{name}': min_workers ({}) exceeds max_workers ({})",
                    entry.min_workers,
                    entry.max_workers
                ));
            }
        }
        if self.restart_only && self.no_restart {
            return Err(anyhow!("restart_only and no_restart are mutually exclusive"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0 when metrics are enabled"));
        }
        Ok(())
    }

    /// Expands a leading `~` in each local file-mount path against `$HOME`
    /// and asserts the resolved path exists, returning the resolved
    /// `remote_path -> local_path` map. Called once at startup; a typo'd
    /// mount path should fail the process immediately rather than surface as
    /// a mysterious sync failure on the first updater run.
    pub fn resolve_file_mounts(&self) -> Result<HashMap<String, String>> {
        let home = std::env::var("HOME").ok();
        let mut resolved = HashMap::with_capacity(self.file_mounts.len());
        for (remote_path, local_path) in &self.file_mounts {
            let expanded = expand_home(local_path, home.as_deref());
            if !std::path::Path::new(&expanded).exists() {
                return Err(anyhow!(
                    "file_mounts entry '{remote_path}' points at local path '{expanded}', which does not exist"
                ));
            }
            resolved.insert(remote_path.clone(), expanded);
        }
        Ok(resolved)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_s)
    }

    /// `"[cluster_name] "` when `prefix_cluster_info` is set, else empty.
    pub fn log_prefix(&self) -> String {
        if self.prefix_cluster_info {
            format!("[{}] ", self.cluster_name)
        } else {
            String::new()
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_s)
    }

    /// `node_type -> NodeTypeConfig` view for the resource-demand scheduler.
    pub fn scheduler_node_types(&self) -> HashMap<NodeTypeName, NodeTypeConfig> {
        self.available_node_types
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone().into()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        cluster_name = "test-cluster"
        head_node_type = "head"

        [available_node_types.head]
        min_workers = 0
        max_workers = 1

        [available_node_types.worker]
        min_workers = 2
        max_workers = 10
        [available_node_types.worker.resources]
        CPU = 4.0
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.cluster_name, "test-cluster");
        assert_eq!(config.max_launch_batch, 5);
        assert_eq!(config.max_concurrent_launches, 10);
        assert_eq!(config.heartbeat_timeout_s, 30);
        assert_eq!(config.update_interval_s, 5);
        assert_eq!(config.upscaling_speed, 1.0);
    }

    #[test]
    fn rejects_unknown_head_node_type() {
        let bad = r#"
            cluster_name = "c"
            head_node_type = "missing"
            [available_node_types.worker]
            min_workers = 0
            max_workers = 1
        "#;
        assert!(Config::from_str(bad).is_err());
    }

    #[test]
    fn rejects_min_workers_exceeding_max_workers() {
        let bad = r#"
            cluster_name = "c"
            head_node_type = "head"
            [available_node_types.head]
            min_workers = 0
            max_workers = 1
            [available_node_types.worker]
            min_workers = 5
            max_workers = 1
        "#;
        assert!(Config::from_str(bad).is_err());
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let with_extra = format!("{MINIMAL}\nsome_future_key = true\n");
        assert!(Config::from_str(&with_extra).is_ok());
    }

    #[test]
    fn expand_home_rewrites_tilde_prefix_only() {
        assert_eq!(expand_home("~/setup.sh", Some("/home/ray")), "/home/ray/setup.sh");
        assert_eq!(expand_home("/abs/setup.sh", Some("/home/ray")), "/abs/setup.sh");
        assert_eq!(expand_home("~", Some("/home/ray")), "/home/ray");
    }

    #[test]
    fn resolve_file_mounts_rejects_missing_local_path() {
        let mut config = Config::from_str(MINIMAL).unwrap();
        config
            .file_mounts
            .insert("/remote/setup.sh".to_string(), "/definitely/missing/path".to_string());
        assert!(config.resolve_file_mounts().is_err());
    }

    #[test]
    fn resolve_file_mounts_accepts_existing_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_str(MINIMAL).unwrap();
        config
            .file_mounts
            .insert("/remote/dir".to_string(), dir.path().to_str().unwrap().to_string());
        let resolved = config.resolve_file_mounts().unwrap();
        assert_eq!(resolved.get("/remote/dir").unwrap(), dir.path().to_str().unwrap());
    }
}
