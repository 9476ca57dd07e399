//! Cluster-wide status snapshot for operators.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::health::{HealthState, HealthStatus, NodeDirectory};
use super::keys::KeySpace;
use super::store::{CoordinationStore, StoreError};
use crate::metrics::{MetricsCollector, NodeCounts};

/// Queue sizes of one node, or summed over the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizes {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueSizes {
    fn add(&mut self, other: &QueueSizes) {
        self.pending += other.pending;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Health and workload of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub status: HealthState,
    pub last_heartbeat: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub error_count: u64,
    pub warning_count: u64,
    #[serde(flatten)]
    pub queues: QueueSizes,
}

/// Point-in-time view of the whole cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub timestamp: DateTime<Utc>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub degraded_nodes: usize,
    pub unhealthy_nodes: usize,
    pub offline_nodes: usize,
    pub nodes: Vec<NodeSummary>,
    pub totals: QueueSizes,
    /// Items parked on the global pool.
    pub unassigned: usize,
    /// Retries scheduled but not yet drained.
    pub scheduled_retries: usize,
}

/// Builds [`ClusterStatus`] snapshots.
#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    directory: NodeDirectory,
    metrics: MetricsCollector,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, directory: NodeDirectory) -> Self {
        Self {
            store,
            keys,
            directory,
            metrics: MetricsCollector::new(),
        }
    }

    /// Collects the current cluster status.
    ///
    /// Nodes whose queues cannot be read are counted by state but left out
    /// of the per-node list and the totals.
    pub async fn cluster_status(&self) -> ClusterStatus {
        let records = self.directory.node_records().await;
        let mut counts = NodeCounts::default();
        for record in &records {
            match record.status {
                HealthState::Healthy => counts.healthy += 1,
                HealthState::Degraded => counts.degraded += 1,
                HealthState::Unhealthy => counts.unhealthy += 1,
                HealthState::Offline => counts.offline += 1,
            }
        }

        let sizes =
            futures::future::join_all(records.iter().map(|r| self.queue_sizes(&r.node_id))).await;

        let mut totals = QueueSizes::default();
        let mut nodes = Vec::with_capacity(records.len());
        for (record, result) in records.iter().zip(sizes) {
            match result {
                Ok(queues) => {
                    totals.add(&queues);
                    nodes.push(summary(record, queues));
                }
                Err(e) => {
                    warn!(node_id = %record.node_id, error = %e, "Failed to read node queues, skipping")
                }
            }
        }

        let unassigned = self
            .store
            .list_len(&self.keys.global_queue())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read unassigned pool length");
                0
            });
        let scheduled_retries = self
            .store
            .sorted_len(&self.keys.retry_queue())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read retry queue length");
                0
            });

        self.metrics.update_cluster_nodes(counts);
        self.metrics.update_queue_depth("pending", totals.pending);
        self.metrics.update_queue_depth("active", totals.active);
        self.metrics.update_queue_depth("completed", totals.completed);
        self.metrics.update_queue_depth("failed", totals.failed);
        self.metrics.update_queue_depth("unassigned", unassigned);
        self.metrics.update_queue_depth("retry", scheduled_retries);

        ClusterStatus {
            timestamp: Utc::now(),
            total_nodes: records.len(),
            healthy_nodes: counts.healthy,
            degraded_nodes: counts.degraded,
            unhealthy_nodes: counts.unhealthy,
            offline_nodes: counts.offline,
            nodes,
            totals,
            unassigned,
            scheduled_retries,
        }
    }

    async fn queue_sizes(&self, node_id: &str) -> Result<QueueSizes, StoreError> {
        Ok(QueueSizes {
            pending: self.store.list_len(&self.keys.node_queue(node_id)).await?,
            active: self.store.hash_len(&self.keys.active(node_id)).await?,
            completed: self.store.hash_len(&self.keys.completed(node_id)).await?,
            failed: self.store.hash_len(&self.keys.failed(node_id)).await?,
        })
    }
}

fn summary(record: &HealthStatus, queues: QueueSizes) -> NodeSummary {
    NodeSummary {
        node_id: record.node_id.clone(),
        status: record.status,
        last_heartbeat: record.last_heartbeat,
        cpu_percent: record.cpu_percent,
        memory_percent: record.memory_percent,
        disk_percent: record.disk_percent,
        error_count: record.error_count,
        warning_count: record.warning_count,
        queues,
    }
}
