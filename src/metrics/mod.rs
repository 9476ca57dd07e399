//! Metrics module for Prometheus-based monitoring.
//!
//! Covers distribution, work item outcomes, failure recovery, heartbeats and
//! cluster-wide queue depths.
//!
//! # Example
//!
//! ```ignore
//! use scrape_cluster::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_completed();
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, NodeCounts};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_ITEMS, CLUSTER_NODES, HEARTBEATS_TOTAL, ITEMS_COMPLETED, ITEMS_DISTRIBUTED,
    ITEMS_FAILED, ITEMS_RECOVERED, NODES_RECOVERED, PROCESSING_DURATION, QUEUE_DEPTH, REGISTRY,
};
