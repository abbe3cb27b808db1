// src/core/resource_demand_scheduler.rs

//! Component F: given current nodes, pending launches, demand bundles, and
//! per-type constraints, decide how many nodes of which type to launch this
//! tick, and which bundles remain unfulfilled.

use crate::core::tags::{NodeId, NodeIp, NodeTypeName};
use std::collections::HashMap;

/// An atomic resource demand: `resource name -> positive quantity`.
/// A `BTreeMap` keeps iteration (and therefore tie-break comparisons)
/// deterministic across runs.
pub type Resource = std::collections::BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct NodeTypeConfig {
    pub resources: Resource,
    pub min_workers: u32,
    pub max_workers: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub available_node_types: HashMap<NodeTypeName, NodeTypeConfig>,
    pub max_workers: u32,
    pub head_node_type: NodeTypeName,
    pub upscaling_speed: f64,
}

/// A worker node as seen by the scheduler: just enough to count it by type
/// and, if connected, look up its utilization/static resources by ip.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub id: NodeId,
    pub node_type: NodeTypeName,
    pub ip: Option<NodeIp>,
}

pub struct SchedulerInputs<'a> {
    pub workers: &'a [WorkerNode],
    pub pending_launches: &'a HashMap<NodeTypeName, i64>,
    /// Ordered; order matters for residual bin-packing.
    pub demands: &'a [Resource],
    pub utilization_by_ip: &'a HashMap<NodeIp, Resource>,
    pub static_resources_by_ip: &'a HashMap<NodeIp, Resource>,
    pub resource_requests: &'a [Resource],
}

/// A demand bundle that could not be met even after this tick's proposed
/// launches.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfulfilledBundle {
    pub bundle: Resource,
    /// `true` if some node type *could* satisfy it (just no free slot this
    /// tick, so it's "pending"); `false` if no node type ever could
    /// ("infeasible").
    pub feasible: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerOutput {
    pub launches: HashMap<NodeTypeName, u32>,
    pub unfulfilled: Vec<UnfulfilledBundle>,
}

/// Whether `node` (a declared resource vector) component-wise dominates
/// `bundle`.
pub fn dominates(node: &Resource, bundle: &Resource) -> bool {
    bundle
        .iter()
        .all(|(k, v)| node.get(k).copied().unwrap_or(0.0) >= *v)
}

/// `bin_pack_residual`: greedy, bundles in input order, nodes scanned in
/// input order; a bundle consumes from the first node that fits it. Returns
/// the remaining node capacities and the bundles that found no fit.
///
/// Order-sensitive by design (spec section 4.F): callers that want to keep
/// most-recently-used nodes filled first must sort `nodes` MRU-first before
/// calling this.
pub fn bin_pack_residual(nodes: &[Resource], bundles: &[Resource]) -> (Vec<Resource>, Vec<Resource>) {
    let mut nodes: Vec<Resource> = nodes.to_vec();
    let mut remaining_bundles = Vec::new();

    for bundle in bundles {
        match nodes.iter().position(|n| dominates(n, bundle)) {
            Some(idx) => {
                for (k, v) in bundle {
                    let entry = nodes[idx].entry(k.clone()).or_insert(0.0);
                    *entry -= v;
                }
            }
            None => remaining_bundles.push(bundle.clone()),
        }
    }

    (nodes, remaining_bundles)
}

/// A bundle is feasible iff some single node type's declared vector
/// dominates it.
pub fn is_feasible(bundle: &Resource, available_node_types: &HashMap<NodeTypeName, NodeTypeConfig>) -> bool {
    available_node_types
        .values()
        .any(|cfg| dominates(&cfg.resources, bundle))
}

/// Deterministic sort key for tie-breaking between feasible node types:
/// lexicographic order of sorted `(resource, amount)` pairs, amount
/// formatted so that numeric and lexicographic order agree for any
/// non-negative quantity actually used in practice.
fn resource_sort_key(resources: &Resource) -> Vec<(String, String)> {
    resources
        .iter()
        .map(|(k, v)| (k.clone(), format!("{v:020.6}")))
        .collect()
}

/// Picks the smallest/cheapest node type that is feasible for `bundle` and
/// still has a free slot (respecting both its own max_workers and the
/// global max_workers cap). Ties broken by node type name.
fn pick_cheapest_feasible_type<'a>(
    config: &'a SchedulerConfig,
    bundle: &Resource,
    counts: &HashMap<NodeTypeName, u32>,
    total_nodes: u32,
) -> Option<&'a str> {
    let mut candidates: Vec<(&str, &NodeTypeConfig)> = config
        .available_node_types
        .iter()
        .filter(|(_, cfg)| dominates(&cfg.resources, bundle))
        .filter(|(name, cfg)| {
            let have = counts.get(name.as_str()).copied().unwrap_or(0);
            have < cfg.max_workers && total_nodes < config.max_workers
        })
        .map(|(name, cfg)| (name.as_str(), cfg))
        .collect();

    candidates.sort_by(|(name_a, cfg_a), (name_b, cfg_b)| {
        resource_sort_key(&cfg_a.resources)
            .cmp(&resource_sort_key(&cfg_b.resources))
            .then_with(|| name_a.cmp(name_b))
    });

    candidates.first().map(|(name, _)| *name)
}

/// Origin of a proposed launch, used to decide what to defer first when the
/// upscaling-speed cap is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchOrigin {
    MinWorkers,
    RequestResources,
    Demand,
}

struct PlanningState {
    counts: HashMap<NodeTypeName, u32>,
    total_nodes: u32,
    /// In-order log of every discretionary (non-min_workers) launch, so the
    /// upscaling cap can defer from the tail deterministically.
    log: Vec<(NodeTypeName, LaunchOrigin)>,
}

impl PlanningState {
    fn record(&mut self, node_type: &str, origin: LaunchOrigin) {
        *self.counts.entry(node_type.to_string()).or_insert(0) += 1;
        self.total_nodes += 1;
        self.log.push((node_type.to_string(), origin));
    }
}

/// Computes this tick's launch plan and any bundles that remain unfulfilled
/// (spec section 4.F).
pub fn plan_launches(config: &SchedulerConfig, inputs: &SchedulerInputs) -> SchedulerOutput {
    let mut counts: HashMap<NodeTypeName, u32> = HashMap::new();
    for w in inputs.workers {
        *counts.entry(w.node_type.clone()).or_insert(0) += 1;
    }
    for (ty, n) in inputs.pending_launches {
        *counts.entry(ty.clone()).or_insert(0) += (*n).max(0) as u32;
    }
    let existing_and_pending_total: u32 = counts.values().sum();

    let mut state = PlanningState {
        counts,
        total_nodes: existing_and_pending_total,
        log: Vec::new(),
    };

    // Step 3: enforce min_workers, unconditionally (never deferred by the
    // upscaling cap below — deferring a min_workers launch would make
    // invariant 3, "live + pending >= min_workers eventually", unenforceable).
    let mut type_names: Vec<&NodeTypeName> = config.available_node_types.keys().collect();
    type_names.sort();
    let mut min_launches: HashMap<NodeTypeName, u32> = HashMap::new();
    for name in type_names {
        let cfg = &config.available_node_types[name];
        let target = cfg.min_workers.min(cfg.max_workers);
        let have = state.counts.get(name).copied().unwrap_or(0);
        if have < target {
            let room = config.max_workers.saturating_sub(state.total_nodes);
            let add = (target - have).min(room);
            if add > 0 {
                for _ in 0..add {
                    state.record(name, LaunchOrigin::MinWorkers);
                }
                *min_launches.entry(name.clone()).or_insert(0) += add;
            }
        }
    }

    // Virtual resource vectors for every node we currently believe exists:
    // live workers (with their real per-node resources for the demand pass),
    // pending launches, and this tick's min_workers launches.
    let mut request_node_pool: Vec<Resource> = Vec::new();
    let mut demand_node_pool: Vec<Resource> = Vec::new();
    for w in inputs.workers {
        let declared = node_resources(config, &w.node_type, w.ip.as_deref(), inputs.static_resources_by_ip);
        request_node_pool.push(declared.clone());
        demand_node_pool.push(apply_utilization(&declared, w.ip.as_deref(), inputs.utilization_by_ip));
    }
    for (ty, n) in inputs.pending_launches {
        if let Some(cfg) = config.available_node_types.get(ty) {
            for _ in 0..(*n).max(0) {
                request_node_pool.push(cfg.resources.clone());
                demand_node_pool.push(cfg.resources.clone());
            }
        }
    }
    for (ty, n) in &min_launches {
        if let Some(cfg) = config.available_node_types.get(ty) {
            for _ in 0..*n {
                request_node_pool.push(cfg.resources.clone());
                demand_node_pool.push(cfg.resources.clone());
            }
        }
    }

    // Step 4: enforce request_resources — every explicit request must
    // eventually be satisfiable.
    let (remaining_pool, residual_requests) = bin_pack_residual(&request_node_pool, inputs.resource_requests);
    request_node_pool = remaining_pool;
    let mut unfulfilled = Vec::new();
    for bundle in &residual_requests {
        satisfy_one_bundle(
            config,
            &mut state,
            &mut request_node_pool,
            &mut demand_node_pool,
            bundle,
            LaunchOrigin::RequestResources,
            &mut unfulfilled,
        );
    }

    // Step 5: meet demand bundles.
    let (remaining_demand_pool, residual_demands) = bin_pack_residual(&demand_node_pool, inputs.demands);
    demand_node_pool = remaining_demand_pool;
    for bundle in &residual_demands {
        satisfy_one_bundle(
            config,
            &mut state,
            &mut request_node_pool,
            &mut demand_node_pool,
            bundle,
            LaunchOrigin::Demand,
            &mut unfulfilled,
        );
    }

    // Step 6: cap total discretionary (non-min_workers) launches.
    let cap = (5u32).max((config.upscaling_speed * existing_and_pending_total as f64).ceil() as u32);
    let discretionary_total = state
        .log
        .iter()
        .filter(|(_, origin)| *origin != LaunchOrigin::MinWorkers)
        .count() as u32;
    let mut launches: HashMap<NodeTypeName, u32> = min_launches;
    if discretionary_total <= cap {
        for (ty, origin) in &state.log {
            if *origin != LaunchOrigin::MinWorkers {
                *launches.entry(ty.clone()).or_insert(0) += 1;
            }
        }
    } else {
        let keep = cap as usize;
        let discretionary: Vec<&(NodeTypeName, LaunchOrigin)> = state
            .log
            .iter()
            .filter(|(_, origin)| *origin != LaunchOrigin::MinWorkers)
            .collect();
        for (ty, _) in discretionary.into_iter().take(keep) {
            *launches.entry(ty.clone()).or_insert(0) += 1;
        }
    }

    SchedulerOutput {
        launches,
        unfulfilled,
    }
}

/// Resolves a node type's declared resource vector, falling back to the
/// static per-ip resources for legacy/empty declarations.
fn node_resources(
    config: &SchedulerConfig,
    node_type: &str,
    ip: Option<&str>,
    static_resources_by_ip: &HashMap<NodeIp, Resource>,
) -> Resource {
    let declared = config
        .available_node_types
        .get(node_type)
        .map(|cfg| cfg.resources.clone())
        .unwrap_or_default();
    if !declared.is_empty() {
        return declared;
    }
    ip.and_then(|ip| static_resources_by_ip.get(ip).cloned())
        .unwrap_or_default()
}

fn apply_utilization(declared: &Resource, ip: Option<&str>, utilization_by_ip: &HashMap<NodeIp, Resource>) -> Resource {
    let Some(ip) = ip else {
        return declared.clone();
    };
    let Some(used) = utilization_by_ip.get(ip) else {
        return declared.clone();
    };
    let mut remaining = declared.clone();
    for (k, used_amount) in used {
        if let Some(v) = remaining.get_mut(k) {
            *v = (*v - used_amount).max(0.0);
        }
    }
    remaining
}

/// Greedily adds launches of the cheapest feasible type until `bundle` fits
/// in the growing node pool, or no type has a free slot. Appends to
/// `unfulfilled` if the bundle can't be satisfied this tick.
#[allow(clippy::too_many_arguments)]
fn satisfy_one_bundle(
    config: &SchedulerConfig,
    state: &mut PlanningState,
    request_pool: &mut Vec<Resource>,
    demand_pool: &mut Vec<Resource>,
    bundle: &Resource,
    origin: LaunchOrigin,
    unfulfilled: &mut Vec<UnfulfilledBundle>,
) {
    let mut remaining = bundle.clone();
    loop {
        if remaining.values().all(|v| *v <= 0.0) {
            return;
        }
        let Some(node_type) = pick_cheapest_feasible_type(config, &remaining, &state.counts, state.total_nodes) else {
            unfulfilled.push(UnfulfilledBundle {
                bundle: bundle.clone(),
                feasible: is_feasible(bundle, &config.available_node_types),
            });
            return;
        };
        let node_type = node_type.to_string();
        state.record(&node_type, origin);
        let resources = config.available_node_types[&node_type].resources.clone();
        request_pool.push(resources.clone());
        demand_pool.push(resources.clone());

        let (new_remaining_pool, new_remaining_bundles) = bin_pack_residual(&[resources], &[remaining.clone()]);
        let _ = new_remaining_pool;
        match new_remaining_bundles.into_iter().next() {
            Some(still_remaining) => remaining = still_remaining,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(pairs: &[(&str, f64)]) -> Resource {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn worker_type(resources: Resource, min_workers: u32, max_workers: u32) -> NodeTypeConfig {
        NodeTypeConfig {
            resources,
            min_workers,
            max_workers,
        }
    }

    #[test]
    fn s1_min_workers_fill() {
        let mut types = HashMap::new();
        types.insert(
            "w".to_string(),
            worker_type(resource(&[("CPU", 4.0)]), 2, 10),
        );
        let config = SchedulerConfig {
            available_node_types: types,
            max_workers: 10,
            head_node_type: "head".to_string(),
            upscaling_speed: 1.0,
        };
        let pending = HashMap::new();
        let inputs = SchedulerInputs {
            workers: &[],
            pending_launches: &pending,
            demands: &[],
            utilization_by_ip: &HashMap::new(),
            static_resources_by_ip: &HashMap::new(),
            resource_requests: &[],
        };

        let output = plan_launches(&config, &inputs);
        assert_eq!(output.launches.get("w"), Some(&2));
        assert!(output.unfulfilled.is_empty());
    }

    #[test]
    fn s2_upscaling_cap_limits_demand_launches() {
        let mut types = HashMap::new();
        types.insert(
            "w".to_string(),
            worker_type(resource(&[("CPU", 4.0)]), 0, 100),
        );
        let config = SchedulerConfig {
            available_node_types: types,
            max_workers: 100,
            head_node_type: "head".to_string(),
            upscaling_speed: 0.5,
        };
        let workers = vec![
            WorkerNode {
                id: "n1".to_string(),
                node_type: "w".to_string(),
                ip: None,
            },
            WorkerNode {
                id: "n2".to_string(),
                node_type: "w".to_string(),
                ip: None,
            },
        ];
        let demands: Vec<Resource> = (0..10).map(|_| resource(&[("CPU", 4.0)])).collect();
        let pending = HashMap::new();
        let inputs = SchedulerInputs {
            workers: &workers,
            pending_launches: &pending,
            demands: &demands,
            utilization_by_ip: &HashMap::new(),
            static_resources_by_ip: &HashMap::new(),
            resource_requests: &[],
        };

        let output = plan_launches(&config, &inputs);
        let total: u32 = output.launches.values().sum();
        assert!(total <= 5, "expected <= 5 launches this tick, got {total}");
    }

    #[test]
    fn s6_infeasible_bundle_reported_and_not_launched() {
        let mut types = HashMap::new();
        types.insert(
            "w".to_string(),
            worker_type(resource(&[("CPU", 4.0)]), 0, 10),
        );
        let config = SchedulerConfig {
            available_node_types: types,
            max_workers: 10,
            head_node_type: "head".to_string(),
            upscaling_speed: 1.0,
        };
        let demands = vec![resource(&[("GPU", 8.0)])];
        let pending = HashMap::new();
        let inputs = SchedulerInputs {
            workers: &[],
            pending_launches: &pending,
            demands: &demands,
            utilization_by_ip: &HashMap::new(),
            static_resources_by_ip: &HashMap::new(),
            resource_requests: &[],
        };

        let output = plan_launches(&config, &inputs);
        assert!(output.launches.is_empty());
        assert_eq!(output.unfulfilled.len(), 1);
        assert!(!output.unfulfilled[0].feasible);
    }

    #[test]
    fn upscaling_speed_zero_still_allows_min_workers() {
        let mut types = HashMap::new();
        types.insert(
            "w".to_string(),
            worker_type(resource(&[("CPU", 4.0)]), 3, 10),
        );
        let config = SchedulerConfig {
            available_node_types: types,
            max_workers: 10,
            head_node_type: "head".to_string(),
            upscaling_speed: 0.0,
        };
        let demands: Vec<Resource> = (0..10).map(|_| resource(&[("CPU", 4.0)])).collect();
        let pending = HashMap::new();
        let inputs = SchedulerInputs {
            workers: &[],
            pending_launches: &pending,
            demands: &demands,
            utilization_by_ip: &HashMap::new(),
            static_resources_by_ip: &HashMap::new(),
            resource_requests: &[],
        };

        let output = plan_launches(&config, &inputs);
        assert_eq!(output.launches.get("w"), Some(&3));
    }

    #[test]
    fn bin_pack_residual_is_monotone_with_more_capacity() {
        let nodes_small = vec![resource(&[("CPU", 2.0)])];
        let nodes_large = vec![resource(&[("CPU", 2.0)]), resource(&[("CPU", 4.0)])];
        let bundles = vec![resource(&[("CPU", 1.0)]), resource(&[("CPU", 3.0)])];

        let (_, residual_small) = bin_pack_residual(&nodes_small, &bundles);
        let (_, residual_large) = bin_pack_residual(&nodes_large, &bundles);
        assert!(residual_large.len() <= residual_small.len());
    }

    #[test]
    fn dominates_checks_every_resource_component() {
        let node = resource(&[("CPU", 4.0), ("GPU", 1.0)]);
        let ok = resource(&[("CPU", 2.0), ("GPU", 1.0)]);
        let too_much = resource(&[("CPU", 2.0), ("GPU", 2.0)]);
        assert!(dominates(&node, &ok));
        assert!(!dominates(&node, &too_much));
    }
}
