//! Load-aware round-robin distribution of work items.
//!
//! New work is spread over the nodes that currently accept work. Nodes are
//! ordered by workload (pending queue length plus in-flight items, ties broken
//! by node id) and item `i` goes to node `i % N`, which biases each batch
//! toward the lighter nodes without a rebalance protocol. All pushes of one
//! call are sent as a single pipelined batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::health::NodeDirectory;
use super::keys::KeySpace;
use super::store::{CoordinationStore, ListPush};
use super::work_item::WorkItem;
use crate::metrics::MetricsCollector;

/// Outcome of one distribution call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionResult {
    /// Number of items submitted.
    pub total: usize,
    /// Number of items pushed onto a node queue.
    pub distributed: usize,
    /// Number of items that could not be placed.
    pub failed: usize,
    /// Items placed per node.
    pub per_node: BTreeMap<String, usize>,
    /// Wall-clock duration of the call in milliseconds.
    pub elapsed_ms: u64,
}

impl DistributionResult {
    fn all_failed(total: usize, started: Instant) -> Self {
        Self {
            total,
            distributed: 0,
            failed: total,
            per_node: BTreeMap::new(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Distribution outcome together with the items that were not placed.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub result: DistributionResult,
    /// Items left without a queue, with `assigned_node` cleared.
    pub undelivered: Vec<WorkItem>,
}

/// Fans work items out over healthy nodes.
#[derive(Clone)]
pub struct WorkDistributor {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    directory: NodeDirectory,
    metrics: MetricsCollector,
}

impl WorkDistributor {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, directory: NodeDirectory) -> Self {
        Self {
            store,
            keys,
            directory,
            metrics: MetricsCollector::new(),
        }
    }

    /// Distributes `items` across the currently healthy nodes.
    pub async fn distribute(&self, items: Vec<WorkItem>) -> DistributionResult {
        self.place(items).await.result
    }

    /// Distributes `items` and hands back whatever could not be placed.
    pub async fn place(&self, items: Vec<WorkItem>) -> Placement {
        let started = Instant::now();
        let total = items.len();

        if items.is_empty() {
            return Placement::default();
        }

        let nodes = self.directory.healthy_nodes().await;
        if nodes.is_empty() {
            warn!(total, "No healthy nodes available, distribution skipped");
            self.metrics.record_distribution(0, total);
            return Placement {
                result: DistributionResult::all_failed(total, started),
                undelivered: unassigned(items),
            };
        }

        let ordered = self.order_by_workload(nodes).await;
        let (pushes, assigned, mut undelivered) = self.assign(items, &ordered);

        let placement = match self.store.push_batch(&pushes).await {
            Ok(()) => {
                let mut per_node = BTreeMap::new();
                for item in &assigned {
                    if let Some(node) = &item.assigned_node {
                        *per_node.entry(node.clone()).or_insert(0) += 1;
                    }
                }
                let distributed = assigned.len();
                Placement {
                    result: DistributionResult {
                        total,
                        distributed,
                        failed: total - distributed,
                        per_node,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    undelivered,
                }
            }
            Err(e) => {
                error!(total, error = %e, "Distribution batch failed");
                undelivered.extend(unassigned(assigned));
                Placement {
                    result: DistributionResult::all_failed(total, started),
                    undelivered,
                }
            }
        };

        self.metrics
            .record_distribution(placement.result.distributed, placement.result.failed);
        info!(
            total,
            distributed = placement.result.distributed,
            failed = placement.result.failed,
            nodes = ordered.len(),
            elapsed_ms = placement.result.elapsed_ms,
            "Distributed work items"
        );

        placement
    }

    /// Pending queue length plus in-flight count of a node.
    ///
    /// Unreadable parts count as zero.
    pub async fn workload(&self, node_id: &str) -> usize {
        let queued = self
            .store
            .list_len(&self.keys.node_queue(node_id))
            .await
            .unwrap_or_else(|e| {
                warn!(node_id, error = %e, "Failed to read queue length");
                0
            });
        let active = self
            .store
            .hash_len(&self.keys.active(node_id))
            .await
            .unwrap_or_else(|e| {
                warn!(node_id, error = %e, "Failed to read active work count");
                0
            });
        queued + active
    }

    async fn order_by_workload(&self, nodes: Vec<String>) -> Vec<String> {
        let loads = futures::future::join_all(nodes.iter().map(|node| self.workload(node))).await;

        let mut weighted: Vec<(usize, String)> = loads.into_iter().zip(nodes).collect();
        weighted.sort();
        debug!(?weighted, "Node workloads");
        weighted.into_iter().map(|(_, node)| node).collect()
    }

    /// Round-robin assignment over `nodes`, which must not be empty.
    fn assign(
        &self,
        items: Vec<WorkItem>,
        nodes: &[String],
    ) -> (Vec<ListPush>, Vec<WorkItem>, Vec<WorkItem>) {
        let mut pushes = Vec::with_capacity(items.len());
        let mut assigned = Vec::with_capacity(items.len());
        let mut undelivered = Vec::new();

        for (i, mut item) in items.into_iter().enumerate() {
            let node = &nodes[i % nodes.len()];
            item.assign(node);
            match serde_json::to_string(&item) {
                Ok(payload) => {
                    pushes.push(ListPush::new(self.keys.node_queue(node), payload));
                    assigned.push(item);
                }
                Err(e) => {
                    warn!(work_id = %item.work_id, error = %e, "Failed to serialize work item");
                    item.reset_for_redistribution();
                    undelivered.push(item);
                }
            }
        }

        (pushes, assigned, undelivered)
    }
}

fn unassigned(items: Vec<WorkItem>) -> Vec<WorkItem> {
    items
        .into_iter()
        .map(|mut item| {
            item.reset_for_redistribution();
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::health::{HealthState, HealthStatus, DEFAULT_HEALTH_FRESHNESS};
    use crate::cluster::memory_store::MemoryStore;
    use crate::cluster::work_item::WorkStatus;
    use chrono::Utc;
    use std::time::Duration;

    async fn register(store: &MemoryStore, keys: &KeySpace, node_id: &str) {
        let status = HealthStatus {
            node_id: node_id.to_string(),
            status: HealthState::Healthy,
            cpu_percent: 5.0,
            memory_percent: 5.0,
            disk_percent: 5.0,
            active_workers: 0,
            last_heartbeat: Utc::now(),
            error_count: 0,
            warning_count: 0,
        };
        store
            .hash_replace_with_ttl(
                &keys.node_health(node_id),
                &status.to_fields(),
                Duration::from_secs(90),
            )
            .await
            .unwrap();
    }

    fn distributor(store: &MemoryStore) -> WorkDistributor {
        let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let keys = KeySpace::default();
        let directory = NodeDirectory::new(Arc::clone(&shared), keys.clone(), DEFAULT_HEALTH_FRESHNESS);
        WorkDistributor::new(shared, keys, directory)
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(format!("w-{}", i), "Berlin", format!("https://example.com/{}", i)))
            .collect()
    }

    async fn queued(store: &MemoryStore, node: &str) -> Vec<WorkItem> {
        store
            .list_all(&KeySpace::default().node_queue(node))
            .await
            .unwrap()
            .iter()
            .rev()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_empty_input_is_all_zero() {
        let store = MemoryStore::new();
        let result = distributor(&store).distribute(Vec::new()).await;

        assert_eq!(result.total, 0);
        assert_eq!(result.distributed, 0);
        assert_eq!(result.failed, 0);
        assert!(result.per_node.is_empty());
    }

    #[tokio::test]
    async fn test_no_healthy_nodes_fails_everything() {
        let store = MemoryStore::new();
        let placement = distributor(&store).place(items(4)).await;

        assert_eq!(placement.result.total, 4);
        assert_eq!(placement.result.failed, 4);
        assert_eq!(placement.result.distributed, 0);
        assert_eq!(placement.undelivered.len(), 4);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_three_items_over_two_idle_nodes() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        register(&store, &keys, "node1").await;
        register(&store, &keys, "node0").await;

        let result = distributor(&store).distribute(items(3)).await;

        assert_eq!(result.distributed, 3);
        assert_eq!(result.failed, 0);
        assert_eq!(result.per_node.get("node0"), Some(&2));
        assert_eq!(result.per_node.get("node1"), Some(&1));

        let node0 = queued(&store, "node0").await;
        let node1 = queued(&store, "node1").await;
        assert_eq!(
            node0.iter().map(|i| i.work_id.as_str()).collect::<Vec<_>>(),
            vec!["w-0", "w-2"]
        );
        assert_eq!(node1[0].work_id, "w-1");
        assert!(node0
            .iter()
            .all(|i| i.status == WorkStatus::Pending && i.assigned_node.as_deref() == Some("node0")));
    }

    #[tokio::test]
    async fn test_round_robin_is_balanced() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        for node in ["a", "b", "c"] {
            register(&store, &keys, node).await;
        }

        let result = distributor(&store).distribute(items(11)).await;

        assert_eq!(result.distributed + result.failed, result.total);
        let counts: Vec<usize> = result.per_node.values().copied().collect();
        assert_eq!(counts.iter().sum::<usize>(), 11);
        assert!(counts.iter().all(|c| *c == 3 || *c == 4));
    }

    #[tokio::test]
    async fn test_lighter_node_is_served_first() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        register(&store, &keys, "a").await;
        register(&store, &keys, "b").await;
        store.push(&keys.node_queue("a"), "{}").await.unwrap();
        store.hash_set(&keys.active("a"), "x", "{}").await.unwrap();

        let dist = distributor(&store);
        assert_eq!(dist.workload("a").await, 2);
        assert_eq!(dist.workload("b").await, 0);

        let result = dist.distribute(items(1)).await;
        assert_eq!(result.per_node.get("b"), Some(&1));
        assert!(result.per_node.get("a").is_none());
    }
}
