// src/core/snapshot.rs

//! Component I: the status view exposed outside the reconciler (logs, the
//! metrics endpoint, and the info string).

use crate::core::tags::{NodeIp, NodeStatus, NodeTypeName};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct PendingNode {
    pub ip: NodeIp,
    pub node_type: NodeTypeName,
    pub status: NodeStatus,
}

/// `Snapshot { active_by_type, pending, pending_launches, failed }` (spec
/// section 4.I). Built fresh each tick from the reconciler's in-memory
/// views plus the node tracker; never persisted.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AutoscalerSnapshot {
    pub active_by_type: HashMap<NodeTypeName, u32>,
    pub pending: Vec<PendingNode>,
    pub pending_launches: HashMap<NodeTypeName, u32>,
    pub failed: Vec<(NodeIp, NodeTypeName)>,
}

/// A classified worker, used while building the snapshot.
pub enum WorkerClassification {
    Active { node_type: NodeTypeName },
    Pending { ip: NodeIp, node_type: NodeTypeName, status: NodeStatus },
}

impl AutoscalerSnapshot {
    pub fn builder() -> AutoscalerSnapshotBuilder {
        AutoscalerSnapshotBuilder::default()
    }

    /// A human-readable multi-line summary, in the spirit of the original
    /// autoscaler's info string: counts by type, then pending, then failed.
    pub fn info_string(&self) -> String {
        let mut lines = Vec::new();
        let mut types: Vec<&NodeTypeName> = self.active_by_type.keys().collect();
        types.sort();
        for ty in types {
            lines.push(format!("{} active: {}", ty, self.active_by_type[ty]));
        }
        for p in &self.pending {
            lines.push(format!("{} ({}): {}", p.ip, p.node_type, p.status));
        }
        if !self.pending_launches.is_empty() {
            let mut launch_types: Vec<&NodeTypeName> = self.pending_launches.keys().collect();
            launch_types.sort();
            for ty in launch_types {
                lines.push(format!("{} pending launches: {}", ty, self.pending_launches[ty]));
            }
        }
        for (ip, ty) in &self.failed {
            lines.push(format!("{ip} ({ty}): failed"));
        }
        if lines.is_empty() {
            "No nodes.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

#[derive(Default)]
pub struct AutoscalerSnapshotBuilder {
    active_by_type: HashMap<NodeTypeName, u32>,
    pending: Vec<PendingNode>,
    pending_launches: HashMap<NodeTypeName, u32>,
    failed: Vec<(NodeIp, NodeTypeName)>,
}

impl AutoscalerSnapshotBuilder {
    pub fn classify(&mut self, node_type: NodeTypeName, ip: NodeIp, status: NodeStatus, is_active: bool) {
        if is_active {
            *self.active_by_type.entry(node_type).or_insert(0) += 1;
        } else if !status.is_terminal() {
            self.pending.push(PendingNode { ip, node_type, status });
        }
        // An inactive, terminal-status node is neither active nor pending;
        // it surfaces via `failed`, sourced from the node tracker instead,
        // since by the time it's terminal it may already be gone from the
        // live worker set.
    }

    pub fn set_pending_launches(&mut self, launches: HashMap<NodeTypeName, u32>) {
        self.pending_launches = launches.into_iter().filter(|(_, n)| *n > 0).collect();
    }

    pub fn set_failed(&mut self, failed: Vec<(NodeIp, NodeTypeName)>) {
        self.failed = failed;
    }

    pub fn build(self) -> AutoscalerSnapshot {
        AutoscalerSnapshot {
            active_by_type: self.active_by_type,
            pending: self.pending,
            pending_launches: self.pending_launches,
            failed: self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_splits_active_and_pending() {
        let mut builder = AutoscalerSnapshot::builder();
        builder.classify("worker".to_string(), "10.0.0.1".to_string(), NodeStatus::UpToDate, true);
        builder.classify(
            "worker".to_string(),
            "10.0.0.2".to_string(),
            NodeStatus::SettingUp,
            false,
        );
        let snapshot = builder.build();
        assert_eq!(snapshot.active_by_type.get("worker"), Some(&1));
        assert_eq!(snapshot.pending.len(), 1);
    }

    #[test]
    fn terminal_inactive_node_is_neither_active_nor_pending() {
        let mut builder = AutoscalerSnapshot::builder();
        builder.classify(
            "worker".to_string(),
            "10.0.0.3".to_string(),
            NodeStatus::UpdateFailed,
            false,
        );
        let snapshot = builder.build();
        assert!(snapshot.active_by_type.is_empty());
        assert!(snapshot.pending.is_empty());
    }

    #[test]
    fn pending_launches_drops_zero_entries() {
        let mut builder = AutoscalerSnapshot::builder();
        builder.set_pending_launches(HashMap::from([("worker".to_string(), 0), ("gpu".to_string(), 2)]));
        let snapshot = builder.build();
        assert_eq!(snapshot.pending_launches.len(), 1);
        assert_eq!(snapshot.pending_launches.get("gpu"), Some(&2));
    }

    #[test]
    fn info_string_lists_all_sections() {
        let mut builder = AutoscalerSnapshot::builder();
        builder.classify("worker".to_string(), "10.0.0.1".to_string(), NodeStatus::UpToDate, true);
        builder.set_failed(vec![("10.0.0.9".to_string(), "worker".to_string())]);
        let snapshot = builder.build();
        let info = snapshot.info_string();
        assert!(info.contains("worker active: 1"));
        assert!(info.contains("failed"));
    }
}
