//! Observability infrastructure for the scale-down core
//!
//! Provides:
//! - Prometheus metrics (unneeded and unremovable nodes, deletions, evictions, latencies)
//! - Structured JSON logging with tracing

use crate::scaledown::{DeletionResult, DeletionResultKind};
use crate::simulator::UnremovableReason;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Histogram buckets for planner and actuator phases (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

pub const FUNCTION_PLANNER_UPDATE: &str = "planner_update";
pub const FUNCTION_CROP_NODES: &str = "crop_nodes";
pub const FUNCTION_DRAIN_NODE: &str = "drain_node";
pub const FUNCTION_DELETE_NODES: &str = "delete_nodes";

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScaleDownMetricsInner> = OnceLock::new();

struct ScaleDownMetricsInner {
    unneeded_nodes: IntGauge,
    unremovable_nodes: IntGaugeVec,
    nodes_deleted: IntCounterVec,
    failed_deletions: IntCounterVec,
    evictions: IntCounterVec,
    function_duration_seconds: HistogramVec,
}

impl ScaleDownMetricsInner {
    fn new() -> Self {
        Self {
            unneeded_nodes: register_int_gauge!(
                "scaledown_unneeded_nodes",
                "Number of nodes currently considered unneeded"
            )
            .expect("Failed to register unneeded_nodes"),

            unremovable_nodes: register_int_gauge_vec!(
                "scaledown_unremovable_nodes",
                "Number of nodes that cannot be removed, by reason",
                &["reason"]
            )
            .expect("Failed to register unremovable_nodes"),

            nodes_deleted: register_int_counter_vec!(
                "scaledown_nodes_deleted_total",
                "Total number of nodes removed by scale-down",
                &["kind"]
            )
            .expect("Failed to register nodes_deleted"),

            failed_deletions: register_int_counter_vec!(
                "scaledown_failed_deletions_total",
                "Total number of node deletions that failed, by result",
                &["kind"]
            )
            .expect("Failed to register failed_deletions"),

            evictions: register_int_counter_vec!(
                "scaledown_evictions_total",
                "Total number of pod evictions attempted during drain",
                &["result"]
            )
            .expect("Failed to register evictions"),

            function_duration_seconds: register_histogram_vec!(
                "scaledown_function_duration_seconds",
                "Time spent in scale-down phases",
                &["function"],
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register function_duration_seconds"),
        }
    }
}

/// Scale-down metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same collectors.
#[derive(Clone)]
pub struct ScaleDownMetrics {
    _private: (),
}

impl Default for ScaleDownMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaleDownMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScaleDownMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScaleDownMetricsInner {
        GLOBAL_METRICS.get_or_init(ScaleDownMetricsInner::new)
    }

    pub fn set_unneeded_nodes(&self, count: usize) {
        self.inner().unneeded_nodes.set(count as i64);
    }

    /// Publishes one gauge per reason; reasons absent from `counts` are reset to zero
    pub fn set_unremovable_nodes(&self, counts: &HashMap<UnremovableReason, usize>) {
        for reason in UnremovableReason::ALL {
            let count = counts.get(&reason).copied().unwrap_or(0);
            self.inner()
                .unremovable_nodes
                .with_label_values(&[reason.as_str()])
                .set(count as i64);
        }
    }

    /// `kind` is "empty" or "drain"
    pub fn inc_nodes_deleted(&self, kind: &str) {
        self.inner().nodes_deleted.with_label_values(&[kind]).inc();
    }

    pub fn inc_failed_deletions(&self, kind: DeletionResultKind) {
        self.inner()
            .failed_deletions
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn inc_evictions(&self, succeeded: bool) {
        let result = if succeeded { "succeeded" } else { "failed" };
        self.inner().evictions.with_label_values(&[result]).inc();
    }

    pub fn observe_duration(&self, function: &str, duration_secs: f64) {
        self.inner()
            .function_duration_seconds
            .with_label_values(&[function])
            .observe(duration_secs);
    }

    /// Renders the default registry in the text exposition format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), JSON or plain output.
/// Fails when a global subscriber is already set; the existing one stays in place.
pub fn init_tracing(json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    }
}

/// Structured logger for scale-down decisions
///
/// Emits one event per significant decision so scale-down activity can be followed from logs.
#[derive(Clone, Default)]
pub struct ScaleDownLogger;

impl ScaleDownLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn log_planner_update(&self, unneeded: usize, unremovable: usize, duration_secs: f64) {
        info!(
            event = "planner_updated",
            unneeded = unneeded,
            unremovable = unremovable,
            duration_secs = duration_secs,
            "Scale-down state updated"
        );
    }

    pub fn log_node_removal(&self, node: &str, node_group: &str, drain: bool, pods: &[String]) {
        let kind = if drain { "drain" } else { "empty" };
        info!(
            event = "node_removal_started",
            node = %node,
            node_group = %node_group,
            kind = kind,
            pods_to_reschedule = %pods.join(","),
            "Scale-down: removing node"
        );
    }

    pub fn log_deletion_result(&self, node: &str, node_group: &str, result: &DeletionResult) {
        if result.is_ok() {
            info!(
                event = "node_deleted",
                node = %node,
                node_group = %node_group,
                "Scale-down: node removed"
            );
        } else {
            warn!(
                event = "node_deletion_failed",
                node = %node,
                node_group = %node_group,
                result = %result.kind,
                reason = ?result.reason,
                error = ?result.err.as_ref().map(|e| e.to_string()),
                "Scale-down: node deletion failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exposed() {
        let metrics = ScaleDownMetrics::new();
        metrics.set_unneeded_nodes(3);
        metrics.set_unremovable_nodes(&HashMap::from([(UnremovableReason::NotUnderutilized, 2)]));
        metrics.inc_nodes_deleted("empty");
        metrics.inc_failed_deletions(DeletionResultKind::FailedToEvictPods);
        metrics.inc_evictions(true);
        metrics.observe_duration(FUNCTION_PLANNER_UPDATE, 0.01);

        let text = metrics.gather_text();
        assert!(text.contains("scaledown_unneeded_nodes"));
        assert!(text.contains("reason=\"NotUnderutilized\""));
        assert!(text.contains("kind=\"failed_to_evict\""));
    }

    #[test]
    fn test_init_tracing_twice_reports_the_second_install() {
        let first = init_tracing(true);
        let second = init_tracing(false);
        assert!(second.is_err(), "first install: {first:?}");
    }
}
