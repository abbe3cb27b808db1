// src/core/tags.rs

//! Tag keys and typed node attributes.
//!
//! A node's tags, as written and read through the `NodeProvider`, are the
//! *only* persistent state the scaler has. Everything else is reconstructed
//! each tick from these tags plus the cluster config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use strum_macros::{Display, EnumString};

/// Opaque provider-assigned node identifier.
pub type NodeId = String;

/// Internal IP address of a node, as reported by the provider.
pub type NodeIp = String;

/// Name of a node type, keying into `available_node_types`.
pub type NodeTypeName = String;

pub const TAG_NODE_KIND: &str = "fleetscaler-node-kind";
pub const TAG_USER_NODE_TYPE: &str = "fleetscaler-node-type";
pub const TAG_NODE_STATUS: &str = "fleetscaler-node-status";
pub const TAG_LAUNCH_CONFIG_HASH: &str = "fleetscaler-launch-config-hash";
pub const TAG_RUNTIME_CONFIG_HASH: &str = "fleetscaler-runtime-config-hash";
pub const TAG_FILE_MOUNTS_CONTENTS_HASH: &str = "fleetscaler-file-mounts-contents-hash";

/// The role a node plays in the cluster, set once at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeKind {
    Head,
    Worker,
    /// A node present in the provider's account but not managed by this
    /// scaler instance (e.g. created by hand). Never terminated or updated.
    Unmanaged,
}

/// Lifecycle status of a node, advanced by the updater and read by the
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NodeStatus {
    Uninitialized,
    WaitingForSsh,
    SyncingFiles,
    SettingUp,
    UpToDate,
    UpdateFailed,
}

impl NodeStatus {
    /// Statuses reached only once an updater has finished (successfully or
    /// not). Used by the snapshot to distinguish "pending" from "failed".
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::UpToDate | NodeStatus::UpdateFailed)
    }
}

/// A node's tag set, exactly as read from the provider.
///
/// Kept as a thin typed view over the raw string map rather than a struct
/// with required fields, because §3's invariant is that a node missing a
/// required tag (e.g. mid-creation) must be skipped for the tick, not treated
/// as an error.
#[derive(Debug, Clone, Default)]
pub struct Tags(pub HashMap<String, String>);

impl Tags {
    pub fn kind(&self) -> Option<NodeKind> {
        self.0.get(TAG_NODE_KIND)?.parse().ok()
    }

    pub fn user_node_type(&self) -> Option<&str> {
        self.0.get(TAG_USER_NODE_TYPE).map(String::as_str)
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.0.get(TAG_NODE_STATUS)?.parse().ok()
    }

    pub fn launch_config_hash(&self) -> Option<&str> {
        self.0.get(TAG_LAUNCH_CONFIG_HASH).map(String::as_str)
    }

    pub fn runtime_config_hash(&self) -> Option<&str> {
        self.0.get(TAG_RUNTIME_CONFIG_HASH).map(String::as_str)
    }

    pub fn file_mounts_contents_hash(&self) -> Option<&str> {
        self.0
            .get(TAG_FILE_MOUNTS_CONTENTS_HASH)
            .map(String::as_str)
    }

    /// A node is only safe to classify once the provider has finished
    /// tagging it; creation and tagging are non-atomic per §3.
    pub fn is_fully_tagged(&self) -> bool {
        let has_base = self.kind().is_some();
        match self.kind() {
            Some(NodeKind::Worker) => has_base && self.user_node_type().is_some(),
            _ => has_base,
        }
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Reason a node was scheduled for termination; surfaced in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TerminationReason {
    NotInAvailableNodeTypes,
    MaxWorkersPerType,
    Idle,
    Outdated,
    MaxWorkers,
    LostContactWithNode,
    LaunchFailed,
    KilledByOperator,
}

impl TerminationReason {
    /// Human-readable text matching the wording used in spec §4.H.a/c/d.
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::NotInAvailableNodeTypes => "not in available_node_types",
            TerminationReason::MaxWorkersPerType => "max_workers_per_type",
            TerminationReason::Idle => "idle",
            TerminationReason::Outdated => "outdated",
            TerminationReason::MaxWorkers => "max workers",
            TerminationReason::LostContactWithNode => "lost contact with node",
            TerminationReason::LaunchFailed => "launch failed",
            TerminationReason::KilledByOperator => "killed by operator",
        }
    }
}
