//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by scrape_cluster and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all scrape_cluster metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Work items handed to the distributor, labeled by outcome (distributed/failed).
pub static ITEMS_DISTRIBUTED: OnceLock<CounterVec> = OnceLock::new();

/// Work items completed by this process.
pub static ITEMS_COMPLETED: OnceLock<Counter> = OnceLock::new();

/// Work item failures, labeled by outcome (retried/exhausted).
pub static ITEMS_FAILED: OnceLock<CounterVec> = OnceLock::new();

/// Dead nodes cleaned up by the failure detector.
pub static NODES_RECOVERED: OnceLock<Counter> = OnceLock::new();

/// Work items migrated away from dead nodes.
pub static ITEMS_RECOVERED: OnceLock<Counter> = OnceLock::new();

/// Heartbeats published, labeled by reported health state.
pub static HEARTBEATS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// In-flight items of this node as of the last heartbeat.
pub static ACTIVE_ITEMS: OnceLock<Gauge> = OnceLock::new();

/// Cluster nodes by health state, as of the last status aggregation.
pub static CLUSTER_NODES: OnceLock<GaugeVec> = OnceLock::new();

/// Cluster-wide queue sizes, labeled by queue (pending/active/completed/failed/unassigned/retry).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Time spent processing one work item, in seconds.
pub static PROCESSING_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls register into a fresh registry that is
/// then discarded, so the first initialization wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Work item metrics
    let items_distributed = CounterVec::new(
        Opts::new(
            "scrape_cluster_items_distributed_total",
            "Work items submitted for distribution",
        ),
        &["outcome"],
    )?;

    let items_completed = Counter::new(
        "scrape_cluster_items_completed_total",
        "Work items completed",
    )?;

    let items_failed = CounterVec::new(
        Opts::new("scrape_cluster_items_failed_total", "Work item failures"),
        &["outcome"],
    )?;

    let processing_duration = Histogram::with_opts(
        HistogramOpts::new(
            "scrape_cluster_processing_duration_seconds",
            "Time spent processing one work item",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    // Recovery metrics
    let nodes_recovered = Counter::new(
        "scrape_cluster_nodes_recovered_total",
        "Dead nodes cleaned up",
    )?;

    let items_recovered = Counter::new(
        "scrape_cluster_items_recovered_total",
        "Work items migrated away from dead nodes",
    )?;

    // Node and cluster metrics
    let heartbeats_total = CounterVec::new(
        Opts::new("scrape_cluster_heartbeats_total", "Heartbeats published"),
        &["status"],
    )?;

    let active_items = Gauge::new(
        "scrape_cluster_active_items",
        "In-flight work items of this node",
    )?;

    let cluster_nodes = GaugeVec::new(
        Opts::new("scrape_cluster_nodes", "Cluster nodes by health state"),
        &["state"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("scrape_cluster_queue_depth", "Cluster-wide queue sizes"),
        &["queue"],
    )?;

    registry.register(Box::new(items_distributed.clone()))?;
    registry.register(Box::new(items_completed.clone()))?;
    registry.register(Box::new(items_failed.clone()))?;
    registry.register(Box::new(processing_duration.clone()))?;
    registry.register(Box::new(nodes_recovered.clone()))?;
    registry.register(Box::new(items_recovered.clone()))?;
    registry.register(Box::new(heartbeats_total.clone()))?;
    registry.register(Box::new(active_items.clone()))?;
    registry.register(Box::new(cluster_nodes.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_DISTRIBUTED.set(items_distributed);
    let _ = ITEMS_COMPLETED.set(items_completed);
    let _ = ITEMS_FAILED.set(items_failed);
    let _ = PROCESSING_DURATION.set(processing_duration);
    let _ = NODES_RECOVERED.set(nodes_recovered);
    let _ = ITEMS_RECOVERED.set(items_recovered);
    let _ = HEARTBEATS_TOTAL.set(heartbeats_total);
    let _ = ACTIVE_ITEMS.set(active_items);
    let _ = CLUSTER_NODES.set(cluster_nodes);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
