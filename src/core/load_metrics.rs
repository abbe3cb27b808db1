// src/core/load_metrics.rs

//! Component G: a read-only-per-tick view over externally reported load. The
//! reconciler consumes it once at the start of a tick; a separate ingestion
//! path (not specified by the core control loop) is responsible for keeping
//! it current between ticks.

use crate::core::resource_demand_scheduler::Resource;
use crate::core::tags::NodeIp;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    last_heartbeat_time_by_ip: HashMap<NodeIp, Instant>,
    last_used_time_by_ip: HashMap<NodeIp, Instant>,
    resource_demands: Vec<Resource>,
    resource_utilization: HashMap<NodeIp, Resource>,
    static_node_resources_by_ip: HashMap<NodeIp, Resource>,
    resource_requests: Vec<Resource>,
    cluster_full_of_actors_detected: bool,
}

/// Read-only per tick (section 4.G). Writers (the metrics ingestion path)
/// and the reconciler's reader share this behind a `RwLock` since reads vastly
/// outnumber writes and never overlap a reconciler tick in practice.
pub struct LoadMetrics {
    inner: RwLock<Inner>,
    heartbeat_timeout: Duration,
}

impl LoadMetrics {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            heartbeat_timeout,
        }
    }

    pub fn last_heartbeat_time_by_ip(&self) -> HashMap<NodeIp, Instant> {
        self.inner.read().last_heartbeat_time_by_ip.clone()
    }

    pub fn last_used_time_by_ip(&self) -> HashMap<NodeIp, Instant> {
        self.inner.read().last_used_time_by_ip.clone()
    }

    pub fn resource_demands(&self) -> Vec<Resource> {
        self.inner.read().resource_demands.clone()
    }

    pub fn resource_utilization(&self) -> HashMap<NodeIp, Resource> {
        self.inner.read().resource_utilization.clone()
    }

    pub fn static_node_resources_by_ip(&self) -> HashMap<NodeIp, Resource> {
        self.inner.read().static_node_resources_by_ip.clone()
    }

    pub fn resource_requests(&self) -> Vec<Resource> {
        self.inner.read().resource_requests.clone()
    }

    pub fn cluster_full_of_actors_detected(&self) -> bool {
        self.inner.read().cluster_full_of_actors_detected
    }

    /// Removes every ip-keyed entry not present in `active_ips`.
    pub fn prune_active_ips(&self, active_ips: &std::collections::HashSet<NodeIp>) {
        let mut inner = self.inner.write();
        inner.last_heartbeat_time_by_ip.retain(|ip, _| active_ips.contains(ip));
        inner.last_used_time_by_ip.retain(|ip, _| active_ips.contains(ip));
        inner.resource_utilization.retain(|ip, _| active_ips.contains(ip));
        inner.static_node_resources_by_ip.retain(|ip, _| active_ips.contains(ip));
    }

    /// Bumps `ip`'s last-heartbeat and last-used to now.
    pub fn mark_active(&self, ip: &NodeIp) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.last_heartbeat_time_by_ip.insert(ip.clone(), now);
        inner.last_used_time_by_ip.insert(ip.clone(), now);
    }

    /// Alive iff `now - last_heartbeat < heartbeat_timeout`. An ip never
    /// heartbeated from is not active (callers apply the first-observation
    /// grace period themselves; see `has_heartbeat`).
    pub fn is_active(&self, ip: &NodeIp) -> bool {
        match self.inner.read().last_heartbeat_time_by_ip.get(ip) {
            Some(t) => t.elapsed() < self.heartbeat_timeout,
            None => false,
        }
    }

    pub fn has_heartbeat(&self, ip: &NodeIp) -> bool {
        self.inner.read().last_heartbeat_time_by_ip.contains_key(ip)
    }

    pub fn last_used(&self, ip: &NodeIp) -> Option<Instant> {
        self.inner.read().last_used_time_by_ip.get(ip).copied()
    }

    // --- ingestion side, used by whatever reports load into the scaler ---

    pub fn record_heartbeat(&self, ip: NodeIp) {
        self.inner.write().last_heartbeat_time_by_ip.insert(ip, Instant::now());
    }

    pub fn set_resource_demands(&self, demands: Vec<Resource>) {
        self.inner.write().resource_demands = demands;
    }

    pub fn set_resource_requests(&self, requests: Vec<Resource>) {
        self.inner.write().resource_requests = requests;
    }

    pub fn set_utilization(&self, ip: NodeIp, utilization: Resource) {
        self.inner.write().resource_utilization.insert(ip, utilization);
    }

    pub fn set_static_resources(&self, ip: NodeIp, resources: Resource) {
        self.inner.write().static_node_resources_by_ip.insert(ip, resources);
    }

    pub fn set_cluster_full_of_actors_detected(&self, detected: bool) {
        self.inner.write().cluster_full_of_actors_detected = detected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_active_then_is_active() {
        let lm = LoadMetrics::new(Duration::from_secs(30));
        lm.mark_active(&"10.0.0.1".to_string());
        assert!(lm.is_active(&"10.0.0.1".to_string()));
    }

    #[test]
    fn unknown_ip_is_not_active() {
        let lm = LoadMetrics::new(Duration::from_secs(30));
        assert!(!lm.is_active(&"10.0.0.9".to_string()));
        assert!(!lm.has_heartbeat(&"10.0.0.9".to_string()));
    }

    #[test]
    fn prune_active_ips_removes_stale_entries() {
        let lm = LoadMetrics::new(Duration::from_secs(30));
        lm.mark_active(&"10.0.0.1".to_string());
        lm.mark_active(&"10.0.0.2".to_string());

        let active: std::collections::HashSet<NodeIp> = ["10.0.0.1".to_string()].into_iter().collect();
        lm.prune_active_ips(&active);

        assert!(lm.has_heartbeat(&"10.0.0.1".to_string()));
        assert!(!lm.has_heartbeat(&"10.0.0.2".to_string()));
    }
}
