// src/core/provider.rs

//! The `NodeProvider` capability: the one boundary through which the scaler
//! observes and mutates the underlying cluster (spec section 5's external
//! interfaces). Real backends (cloud APIs, on-prem fleets) implement this;
//! tests use the in-memory fake below.

use crate::core::errors::ScalerError;
use crate::core::hashing::stable_hash;
use crate::core::tags::{NodeId, NodeIp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Tags to set on node creation, and the read/write surface used afterward.
///
/// Tag writes must be visible to subsequent reads on the same provider
/// instance, though not necessarily atomic with node creation — callers must
/// tolerate observing a freshly created node with an incomplete tag set for
/// one or more ticks.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// All non-terminated node ids, optionally restricted to those whose
    /// tags are a superset of `tag_filter`.
    async fn non_terminated_nodes(&self, tag_filter: &HashMap<String, String>) -> Result<Vec<NodeId>, ScalerError>;

    async fn node_tags(&self, id: &NodeId) -> Result<HashMap<String, String>, ScalerError>;

    async fn set_node_tags(&self, id: &NodeId, tags: HashMap<String, String>) -> Result<(), ScalerError>;

    async fn internal_ip(&self, id: &NodeId) -> Result<NodeIp, ScalerError>;

    /// Best-effort creation of `count` nodes of `node_type`, tagged with
    /// `tags`. Failures raise; callers decide how to account for partial
    /// progress.
    async fn create_node(
        &self,
        node_type: &str,
        count: u32,
        tags: HashMap<String, String>,
    ) -> Result<Vec<NodeId>, ScalerError>;

    async fn terminate_node(&self, id: &NodeId) -> Result<(), ScalerError>;

    async fn terminate_nodes(&self, ids: &[NodeId]) -> Result<(), ScalerError>;

    async fn is_terminated(&self, id: &NodeId) -> Result<bool, ScalerError>;
}

/// Runs a command against a node, e.g. over SSH. The core spec only needs a
/// boolean outcome and duration; the updater owns interpreting failures.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, node_id: &NodeId, command: &str) -> Result<bool, ScalerError>;
}

/// Caches constructed provider instances keyed by their canonical config
/// plus cluster name, so two scalers in the same process sharing a
/// provider config (e.g. two clusters in one cloud account) reuse a
/// connection rather than each opening their own. Scoped to whatever owns
/// it; never a process-wide global.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Mutex<HashMap<(String, String), Arc<dyn NodeProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached provider for `(provider_config, cluster_name)`,
    /// constructing one with `build` on first use.
    pub fn get_or_create<C, F>(&self, provider_config: &C, cluster_name: &str, build: F) -> Arc<dyn NodeProvider>
    where
        C: Serialize,
        F: FnOnce() -> Arc<dyn NodeProvider>,
    {
        let key = (stable_hash(provider_config), cluster_name.to_string());
        let mut entries = self.entries.lock();
        entries.entry(key).or_insert_with(build).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(any(test, feature = "fake-provider"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Default)]
    pub struct FakeNode {
        pub tags: HashMap<String, String>,
        pub ip: NodeIp,
        pub terminated: bool,
    }

    /// An in-memory `NodeProvider` for tests: no network, fully
    /// deterministic, with hooks to inject failures.
    #[derive(Default)]
    pub struct FakeProvider {
        nodes: Mutex<HashMap<NodeId, FakeNode>>,
        next_id: AtomicU64,
        pub fail_create: std::sync::atomic::AtomicBool,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_node(&self, id: NodeId, node: FakeNode) {
            self.nodes.lock().insert(id, node);
        }

        pub fn node_count(&self) -> usize {
            self.nodes.lock().values().filter(|n| !n.terminated).count()
        }
    }

    #[async_trait]
    impl NodeProvider for FakeProvider {
        async fn non_terminated_nodes(&self, tag_filter: &HashMap<String, String>) -> Result<Vec<NodeId>, ScalerError> {
            Ok(self
                .nodes
                .lock()
                .iter()
                .filter(|(_, n)| !n.terminated)
                .filter(|(_, n)| tag_filter.iter().all(|(k, v)| n.tags.get(k) == Some(v)))
                .map(|(id, _)| id.clone())
                .collect())
        }

        async fn node_tags(&self, id: &NodeId) -> Result<HashMap<String, String>, ScalerError> {
            self.nodes
                .lock()
                .get(id)
                .map(|n| n.tags.clone())
                .ok_or_else(|| ScalerError::ProviderTransient(format!("unknown node {id}")))
        }

        async fn set_node_tags(&self, id: &NodeId, tags: HashMap<String, String>) -> Result<(), ScalerError> {
            let mut nodes = self.nodes.lock();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| ScalerError::ProviderTransient(format!("unknown node {id}")))?;
            node.tags.extend(tags);
            Ok(())
        }

        async fn internal_ip(&self, id: &NodeId) -> Result<NodeIp, ScalerError> {
            self.nodes
                .lock()
                .get(id)
                .map(|n| n.ip.clone())
                .ok_or_else(|| ScalerError::ProviderTransient(format!("unknown node {id}")))
        }

        async fn create_node(
            &self,
            _node_type: &str,
            count: u32,
            tags: HashMap<String, String>,
        ) -> Result<Vec<NodeId>, ScalerError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ScalerError::NodeLaunch("fake provider: injected failure".to_string()));
            }
            let mut nodes = self.nodes.lock();
            let mut created = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let id = format!("fake-node-{n}");
                nodes.insert(
                    id.clone(),
                    FakeNode {
                        tags: tags.clone(),
                        ip: format!("10.0.0.{}", n % 254 + 1),
                        terminated: false,
                    },
                );
                created.push(id);
            }
            Ok(created)
        }

        async fn terminate_node(&self, id: &NodeId) -> Result<(), ScalerError> {
            if let Some(n) = self.nodes.lock().get_mut(id) {
                n.terminated = true;
            }
            Ok(())
        }

        async fn terminate_nodes(&self, ids: &[NodeId]) -> Result<(), ScalerError> {
            let mut nodes = self.nodes.lock();
            for id in ids {
                if let Some(n) = nodes.get_mut(id) {
                    n.terminated = true;
                }
            }
            Ok(())
        }

        async fn is_terminated(&self, id: &NodeId) -> Result<bool, ScalerError> {
            Ok(self.nodes.lock().get(id).map(|n| n.terminated).unwrap_or(true))
        }
    }

    /// A `CommandRunner` that always succeeds instantly, or always fails if
    /// configured to.
    #[derive(Default)]
    pub struct FakeCommandRunner {
        pub fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CommandRunner for FakeCommandRunner {
        async fn run(&self, _node_id: &NodeId, _command: &str) -> Result<bool, ScalerError> {
            Ok(!self.fail.load(Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProvider;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn registry_reuses_provider_for_same_key() {
        let registry = ProviderRegistry::new();
        let cfg: BTreeMap<&str, &str> = BTreeMap::from([("type", "fake")]);

        let a = registry.get_or_create(&cfg, "cluster-a", || Arc::new(FakeProvider::new()));
        let b = registry.get_or_create(&cfg, "cluster-a", || Arc::new(FakeProvider::new()));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_separates_by_cluster_name() {
        let registry = ProviderRegistry::new();
        let cfg: BTreeMap<&str, &str> = BTreeMap::from([("type", "fake")]);

        registry.get_or_create(&cfg, "cluster-a", || Arc::new(FakeProvider::new()));
        registry.get_or_create(&cfg, "cluster-b", || Arc::new(FakeProvider::new()));
        assert_eq!(registry.len(), 2);
    }
}
