// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the reconciler's own health.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifetime.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram,
};

lazy_static! {
    // --- Tick-level gauges and histogram ---
    pub static ref TICK_DURATION_SECONDS: Histogram =
        register_histogram!("fleetscaler_tick_duration_seconds", "Duration of one reconciler tick.").unwrap();
    pub static ref LAST_TICK_SUCCESS: Gauge =
        register_gauge!("fleetscaler_last_tick_success", "1 if the last tick completed without a counted failure, else 0.").unwrap();
    pub static ref TICK_FAILURES_TOTAL: Counter =
        register_counter!("fleetscaler_tick_failures_total", "Total tick failures counted against max_failures.").unwrap();

    // --- Fleet gauges, labeled by node type ---
    pub static ref ACTIVE_NODES: GaugeVec =
        register_gauge_vec!("fleetscaler_active_nodes", "Active (heartbeating) worker nodes by type.", &["node_type"]).unwrap();
    pub static ref PENDING_NODES: GaugeVec =
        register_gauge_vec!("fleetscaler_pending_nodes", "Worker nodes not yet up-to-date, by type.", &["node_type"]).unwrap();
    pub static ref PENDING_LAUNCHES: GaugeVec =
        register_gauge_vec!("fleetscaler_pending_launches", "Launches enqueued but not yet resolved, by type.", &["node_type"]).unwrap();
    pub static ref FAILED_NODES: Gauge =
        register_gauge!("fleetscaler_failed_nodes", "Nodes the tracker believes failed and not reconciled away.").unwrap();

    // --- Launch/terminate/update counters ---
    pub static ref NODES_LAUNCHED_TOTAL: CounterVec =
        register_counter_vec!("fleetscaler_nodes_launched_total", "Nodes successfully launched, by type.", &["node_type"]).unwrap();
    pub static ref LAUNCH_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("fleetscaler_launch_failures_total", "Launch attempts that failed, by type.", &["node_type"]).unwrap();
    pub static ref NODES_TERMINATED_TOTAL: CounterVec =
        register_counter_vec!("fleetscaler_nodes_terminated_total", "Nodes terminated, by reason.", &["reason"]).unwrap();
    pub static ref UPDATES_SUCCEEDED_TOTAL: Counter =
        register_counter!("fleetscaler_updates_succeeded_total", "Updater runs that finished with exit code 0.").unwrap();
    pub static ref UPDATES_FAILED_TOTAL: Counter =
        register_counter!("fleetscaler_updates_failed_total", "Updater runs that finished with a non-zero exit code.").unwrap();
    pub static ref RECOVERIES_TOTAL: Counter =
        register_counter!("fleetscaler_recoveries_total", "Recovery updaters (for_recovery=true) that succeeded.").unwrap();

    // --- Demand bundles ---
    pub static ref UNFULFILLED_BUNDLES: GaugeVec =
        register_gauge_vec!("fleetscaler_unfulfilled_bundles", "Demand bundles not satisfiable this tick, by feasibility.", &["feasible"]).unwrap();
}

pub fn record_nodes_launched(node_type: &str, count: u64) {
    NODES_LAUNCHED_TOTAL.with_label_values(&[node_type]).inc_by(count as f64);
}

pub fn record_launch_failure(node_type: &str) {
    LAUNCH_FAILURES_TOTAL.with_label_values(&[node_type]).inc();
}

pub fn record_termination(reason: &str) {
    NODES_TERMINATED_TOTAL.with_label_values(&[reason]).inc();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
