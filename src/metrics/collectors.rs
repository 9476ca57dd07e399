//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! records unconditionally and only the binary decides whether metrics exist.

use super::prometheus::{
    ACTIVE_ITEMS, CLUSTER_NODES, HEARTBEATS_TOTAL, ITEMS_COMPLETED, ITEMS_DISTRIBUTED,
    ITEMS_FAILED, ITEMS_RECOVERED, NODES_RECOVERED, PROCESSING_DURATION, QUEUE_DEPTH,
};

/// Node counts by health state, as published by the status aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub offline: usize,
}

/// Metrics collector for recording cluster coordination metrics.
///
/// # Example
///
/// ```ignore
/// use scrape_cluster::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_distribution(10, 0);
/// collector.record_completed();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one distribution call.
    pub fn record_distribution(&self, distributed: usize, failed: usize) {
        if let Some(items) = ITEMS_DISTRIBUTED.get() {
            items
                .with_label_values(&["distributed"])
                .inc_by(distributed as f64);
            items.with_label_values(&["failed"]).inc_by(failed as f64);
        }

        tracing::trace!(distributed, failed, "Recorded distribution metric");
    }

    /// Record one completed work item.
    pub fn record_completed(&self) {
        if let Some(completed) = ITEMS_COMPLETED.get() {
            completed.inc();
        }
    }

    /// Record one work item failure.
    ///
    /// `retried` tells whether a retry was scheduled or the item is exhausted.
    pub fn record_failure(&self, retried: bool) {
        if let Some(failed) = ITEMS_FAILED.get() {
            let outcome = if retried { "retried" } else { "exhausted" };
            failed.with_label_values(&[outcome]).inc();
        }
    }

    /// Record how long processing one item took.
    pub fn record_processing(&self, duration_secs: f64) {
        if let Some(duration) = PROCESSING_DURATION.get() {
            duration.observe(duration_secs);
        }
    }

    /// Record one failure detection pass.
    pub fn record_recovery(&self, nodes: usize, items: usize) {
        if let Some(recovered) = NODES_RECOVERED.get() {
            recovered.inc_by(nodes as f64);
        }
        if let Some(recovered) = ITEMS_RECOVERED.get() {
            recovered.inc_by(items as f64);
        }

        tracing::trace!(nodes, items, "Recorded recovery metric");
    }

    /// Record a published heartbeat.
    pub fn record_heartbeat(&self, status: &str, active_items: usize) {
        if let Some(heartbeats) = HEARTBEATS_TOTAL.get() {
            heartbeats.with_label_values(&[status]).inc();
        }
        if let Some(active) = ACTIVE_ITEMS.get() {
            active.set(active_items as f64);
        }
    }

    /// Update the node-count gauges.
    pub fn update_cluster_nodes(&self, counts: NodeCounts) {
        if let Some(nodes) = CLUSTER_NODES.get() {
            nodes
                .with_label_values(&["healthy"])
                .set(counts.healthy as f64);
            nodes
                .with_label_values(&["degraded"])
                .set(counts.degraded as f64);
            nodes
                .with_label_values(&["unhealthy"])
                .set(counts.unhealthy as f64);
            nodes
                .with_label_values(&["offline"])
                .set(counts.offline as f64);
        }
    }

    /// Update the depth gauge of one queue.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue, depth, "Updated queue depth metric");
    }
}
