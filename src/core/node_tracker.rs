// src/core/node_tracker.rs

//! Bounded, best-effort soft map of recently-seen nodes, used only to
//! surface a "recently failed" list for the status snapshot. Never a gate
//! for correctness (component B).

use crate::core::tags::{NodeId, NodeIp, NodeTypeName};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
struct TrackedNode {
    ip: NodeIp,
    node_type: NodeTypeName,
}

/// Bounded LRU `NodeId -> (ip, type)`. Advisory telemetry only.
pub struct NodeTracker {
    inner: Mutex<LruCache<NodeId, TrackedNode>>,
}

impl Default for NodeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NodeTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Updates (and moves to front) the tracked entry for `id`.
    pub fn track(&self, id: NodeId, ip: NodeIp, node_type: NodeTypeName) {
        self.inner.lock().put(id, TrackedNode { ip, node_type });
    }

    /// Removes `id`, e.g. once it has been cleanly terminated.
    pub fn untrack(&self, id: &NodeId) {
        self.inner.lock().pop(id);
    }

    /// Returns `(ip, type)` for every tracked id not present in
    /// `non_failed`, i.e. ids we believe are dead because the reconciler no
    /// longer considers them active or pending.
    pub fn get_all_failed_node_info(&self, non_failed: &HashSet<NodeId>) -> Vec<(NodeIp, NodeTypeName)> {
        self.inner
            .lock()
            .iter()
            .filter(|(id, _)| !non_failed.contains(*id))
            .map(|(_, tracked)| (tracked.ip.clone(), tracked.node_type.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_get_failed() {
        let tracker = NodeTracker::new(10);
        tracker.track("n1".to_string(), "10.0.0.1".to_string(), "worker".to_string());
        tracker.track("n2".to_string(), "10.0.0.2".to_string(), "worker".to_string());

        let non_failed: HashSet<NodeId> = HashSet::from(["n1".to_string()]);
        let failed = tracker.get_all_failed_node_info(&non_failed);
        assert_eq!(failed, vec![("10.0.0.2".to_string(), "worker".to_string())]);
    }

    #[test]
    fn untrack_removes_entry() {
        let tracker = NodeTracker::new(10);
        tracker.track("n1".to_string(), "10.0.0.1".to_string(), "worker".to_string());
        tracker.untrack(&"n1".to_string());
        assert!(tracker.is_empty());
    }

    #[test]
    fn bounded_capacity_evicts_lru() {
        let tracker = NodeTracker::new(2);
        tracker.track("n1".to_string(), "ip1".to_string(), "t".to_string());
        tracker.track("n2".to_string(), "ip2".to_string(), "t".to_string());
        tracker.track("n3".to_string(), "ip3".to_string(), "t".to_string());
        assert_eq!(tracker.len(), 2);

        let non_failed: HashSet<NodeId> = HashSet::new();
        let failed = tracker.get_all_failed_node_info(&non_failed);
        assert_eq!(failed.len(), 2);
        assert!(!failed.iter().any(|(ip, _)| ip == "ip1"));
    }
}
