//! Failure detection and redistribution of a dead node's work.
//!
//! A node is considered dead once its last heartbeat is older than the stale
//! threshold. Dead nodes are found through two sources: health records that
//! still exist but carry an old heartbeat, and the node registry, which
//! outlives the self-expiring health key. Every pending and in-flight item of
//! a dead node is reset and run back through the distributor; whatever cannot
//! be placed is parked on the global pool. Keys are only deleted once every
//! item has somewhere to go.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::distribution::WorkDistributor;
use super::health::NodeDirectory;
use super::keys::KeySpace;
use super::lifecycle::parse_items;
use super::lock::LockManager;
use super::store::{CoordinationStore, ListPush};
use super::work_item::{timestamp_score, WorkItem};
use crate::metrics::MetricsCollector;

/// Default heartbeat age after which a node is considered dead.
pub const DEFAULT_STALE_NODE_THRESHOLD: Duration = Duration::from_secs(300);

/// Default time to live of the per-node recovery lock.
pub const DEFAULT_RECOVERY_LOCK_TTL: Duration = Duration::from_secs(60);

/// Thresholds of the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub stale_threshold: Duration,
    /// Serialize the migration of each dead node across detectors.
    pub exclusive: bool,
    pub lock_ttl: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            stale_threshold: DEFAULT_STALE_NODE_THRESHOLD,
            exclusive: true,
            lock_ttl: DEFAULT_RECOVERY_LOCK_TTL,
        }
    }
}

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Dead nodes whose keys were removed.
    pub nodes_cleaned: usize,
    /// Items read back from dead nodes.
    pub items_recovered: usize,
    /// Recovered items pushed onto a live node's queue.
    pub items_redistributed: usize,
    /// Recovered items parked on the global pool.
    pub items_parked: usize,
    /// Dead nodes left for a later pass.
    pub nodes_skipped: Vec<String>,
}

#[derive(Debug, Default)]
struct NodeRecovery {
    recovered: usize,
    redistributed: usize,
    parked: usize,
}

/// Finds dead nodes and migrates their work to live ones.
#[derive(Clone)]
pub struct FailureDetector {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    node_id: String,
    directory: NodeDirectory,
    distributor: WorkDistributor,
    locks: LockManager,
    policy: RecoveryPolicy,
    metrics: MetricsCollector,
}

impl FailureDetector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        node_id: impl Into<String>,
        directory: NodeDirectory,
        distributor: WorkDistributor,
        locks: LockManager,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            store,
            keys,
            node_id: node_id.into(),
            directory,
            distributor,
            locks,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one detection pass against the current time.
    pub async fn cleanup_stale_nodes(&self) -> RecoveryReport {
        self.cleanup_stale_nodes_at(Utc::now()).await
    }

    /// Runs one detection pass, judging staleness at `now`.
    pub async fn cleanup_stale_nodes_at(&self, now: DateTime<Utc>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let candidates = self.stale_nodes(now).await;

        if candidates.is_empty() {
            debug!("No stale nodes found");
            return report;
        }

        for node in candidates {
            match self.recover_exclusive(&node).await {
                Some(recovered) => {
                    report.nodes_cleaned += 1;
                    report.items_recovered += recovered.recovered;
                    report.items_redistributed += recovered.redistributed;
                    report.items_parked += recovered.parked;
                }
                None => report.nodes_skipped.push(node),
            }
        }

        self.metrics
            .record_recovery(report.nodes_cleaned, report.items_recovered);
        info!(
            nodes_cleaned = report.nodes_cleaned,
            items_recovered = report.items_recovered,
            items_redistributed = report.items_redistributed,
            items_parked = report.items_parked,
            skipped = report.nodes_skipped.len(),
            "Stale node cleanup finished"
        );
        report
    }

    /// Ids of nodes whose last heartbeat is older than the stale threshold.
    pub async fn stale_nodes(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = self.policy.stale_threshold;
        let mut fresh = BTreeSet::new();
        let mut stale = BTreeSet::new();

        for record in self.directory.node_records().await {
            if record.heartbeat_age(now) > threshold {
                stale.insert(record.node_id);
            } else {
                fresh.insert(record.node_id);
            }
        }

        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        match self
            .store
            .sorted_range_until(&self.keys.node_registry(), timestamp_score(cutoff))
            .await
        {
            Ok(members) => stale.extend(members.into_iter().map(|(node, _)| node)),
            Err(e) => warn!(error = %e, "Failed to read node registry"),
        }

        stale
            .into_iter()
            .filter(|node| node != &self.node_id && !fresh.contains(node))
            .collect()
    }

    async fn recover_exclusive(&self, node: &str) -> Option<NodeRecovery> {
        if !self.policy.exclusive {
            return self.recover_node(node).await;
        }

        let lock_name = KeySpace::recovery_lock_name(node);
        if !self.locks.acquire(&lock_name, self.policy.lock_ttl).await {
            debug!(dead_node = node, "Recovery already in progress elsewhere");
            return None;
        }

        let recovered = self.recover_node(node).await;
        self.locks.release(&lock_name).await;
        recovered
    }

    /// Migrates the work of one dead node. None leaves its keys in place.
    async fn recover_node(&self, node: &str) -> Option<NodeRecovery> {
        let active_key = self.keys.active(node);
        let queue_key = self.keys.node_queue(node);

        let active = match self.store.hash_get_all(&active_key).await {
            Ok(active) => active,
            Err(e) => {
                warn!(dead_node = node, error = %e, "Failed to read active work of dead node");
                return None;
            }
        };
        let queued = match self.store.list_all(&queue_key).await {
            Ok(queued) => queued,
            Err(e) => {
                warn!(dead_node = node, error = %e, "Failed to read queue of dead node");
                return None;
            }
        };

        // The list is stored newest first.
        let mut items = parse_items(active.values());
        items.extend(parse_items(queued.iter().rev()));
        for item in &mut items {
            item.reset_for_redistribution();
        }

        let recovered = items.len();
        let mut outcome = NodeRecovery {
            recovered,
            ..NodeRecovery::default()
        };

        if recovered > 0 {
            let placement = self.distributor.place(items).await;
            outcome.redistributed = placement.result.distributed;
            outcome.parked = placement.undelivered.len();

            if !self.park(&placement.undelivered).await {
                error!(
                    dead_node = node,
                    parked = outcome.parked,
                    "Failed to park undelivered work, keeping dead node keys"
                );
                return None;
            }
        }

        let doomed = vec![active_key, queue_key, self.keys.node_health(node)];
        if let Err(e) = self.store.delete(&doomed).await {
            warn!(dead_node = node, error = %e, "Failed to delete dead node keys");
            return None;
        }
        if let Err(e) = self
            .store
            .sorted_remove(&self.keys.node_registry(), node)
            .await
        {
            warn!(dead_node = node, error = %e, "Failed to remove dead node from registry");
        }

        info!(
            dead_node = node,
            recovered = outcome.recovered,
            redistributed = outcome.redistributed,
            parked = outcome.parked,
            "Recovered work of dead node"
        );
        Some(outcome)
    }

    /// Pushes items onto the global pool in one batch.
    async fn park(&self, items: &[WorkItem]) -> bool {
        park_items(self.store.as_ref(), &self.keys, items).await
    }
}

/// Pushes `items` onto the global pool in one batch.
pub(crate) async fn park_items(
    store: &dyn CoordinationStore,
    keys: &KeySpace,
    items: &[WorkItem],
) -> bool {
    if items.is_empty() {
        return true;
    }

    let pool = keys.global_queue();
    let mut pushes = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::to_string(item) {
            Ok(payload) => pushes.push(ListPush::new(pool.clone(), payload)),
            Err(e) => {
                error!(work_id = %item.work_id, error = %e, "Failed to serialize item for parking");
                return false;
            }
        }
    }

    match store.push_batch(&pushes).await {
        Ok(()) => true,
        Err(e) => {
            error!(count = items.len(), error = %e, "Failed to park items on the global pool");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::health::{HealthState, HealthStatus, DEFAULT_HEALTH_FRESHNESS};
    use crate::cluster::memory_store::MemoryStore;
    use crate::cluster::work_item::WorkStatus;

    struct Fixture {
        store: MemoryStore,
        keys: KeySpace,
        detector: FailureDetector,
    }

    fn fixture(node_id: &str, policy: RecoveryPolicy) -> Fixture {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let directory = NodeDirectory::new(Arc::clone(&shared), keys.clone(), DEFAULT_HEALTH_FRESHNESS);
        let distributor = WorkDistributor::new(Arc::clone(&shared), keys.clone(), directory.clone());
        let locks = LockManager::new(Arc::clone(&shared), keys.clone(), node_id);
        let detector = FailureDetector::new(
            shared,
            keys.clone(),
            node_id,
            directory,
            distributor,
            locks,
            policy,
        );
        Fixture {
            store,
            keys,
            detector,
        }
    }

    async fn heartbeat(fx: &Fixture, node: &str, age: chrono::Duration) {
        let seen = Utc::now() - age;
        let status = HealthStatus {
            node_id: node.to_string(),
            status: HealthState::Healthy,
            cpu_percent: 1.0,
            memory_percent: 1.0,
            disk_percent: 1.0,
            active_workers: 0,
            last_heartbeat: seen,
            error_count: 0,
            warning_count: 0,
        };
        fx.store
            .hash_replace_with_ttl(&fx.keys.node_health(node), &status.to_fields(), Duration::from_secs(900))
            .await
            .unwrap();
        fx.store
            .sorted_add(&fx.keys.node_registry(), node, timestamp_score(seen))
            .await
            .unwrap();
    }

    /// Registry entry only, as left behind after the health key expired.
    async fn ghost(fx: &Fixture, node: &str, age: chrono::Duration) {
        fx.store
            .sorted_add(&fx.keys.node_registry(), node, timestamp_score(Utc::now() - age))
            .await
            .unwrap();
    }

    async fn load_dead_node(fx: &Fixture, node: &str, active: usize, queued: usize) {
        for i in 0..active {
            let mut item = WorkItem::new(format!("active-{}", i), "Oslo", "https://example.com");
            item.assign(node);
            item.start(Utc::now());
            fx.store
                .hash_set(&fx.keys.active(node), &item.work_id, &serde_json::to_string(&item).unwrap())
                .await
                .unwrap();
        }
        for i in 0..queued {
            let mut item = WorkItem::new(format!("queued-{}", i), "Oslo", "https://example.com");
            item.assign(node);
            fx.store
                .push(&fx.keys.node_queue(node), &serde_json::to_string(&item).unwrap())
                .await
                .unwrap();
        }
    }

    async fn queue_items(fx: &Fixture, key: &str) -> Vec<WorkItem> {
        fx.store
            .list_all(key)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_dead_node_work_is_redistributed() {
        let fx = fixture("node-a", RecoveryPolicy::default());
        heartbeat(&fx, "node-a", chrono::Duration::seconds(5)).await;
        heartbeat(&fx, "node-b", chrono::Duration::seconds(5)).await;
        ghost(&fx, "node-dead", chrono::Duration::minutes(10)).await;
        load_dead_node(&fx, "node-dead", 2, 3).await;

        let report = fx.detector.cleanup_stale_nodes().await;

        assert_eq!(report.nodes_cleaned, 1);
        assert_eq!(report.items_recovered, 5);
        assert_eq!(report.items_redistributed, 5);
        assert_eq!(report.items_parked, 0);

        let mut moved = queue_items(&fx, &fx.keys.node_queue("node-a")).await;
        moved.extend(queue_items(&fx, &fx.keys.node_queue("node-b")).await);
        assert_eq!(moved.len(), 5);
        assert!(moved.iter().all(|item| item.status == WorkStatus::Pending
            && item.started_at.is_none()
            && item.retry_count == 0
            && item.assigned_node.as_deref() != Some("node-dead")));

        assert!(!fx.store.exists(&fx.keys.active("node-dead")).await.unwrap());
        assert!(!fx.store.exists(&fx.keys.node_queue("node-dead")).await.unwrap());
        let registry = fx
            .store
            .sorted_range_until(&fx.keys.node_registry(), f64::INFINITY)
            .await
            .unwrap();
        assert!(registry.iter().all(|(node, _)| node != "node-dead"));
    }

    #[tokio::test]
    async fn test_stale_health_record_is_cleaned() {
        let fx = fixture("node-a", RecoveryPolicy::default());
        heartbeat(&fx, "node-a", chrono::Duration::seconds(1)).await;
        heartbeat(&fx, "node-old", chrono::Duration::minutes(6)).await;
        load_dead_node(&fx, "node-old", 1, 0).await;

        let report = fx.detector.cleanup_stale_nodes().await;

        assert_eq!(report.nodes_cleaned, 1);
        assert!(!fx.store.exists(&fx.keys.node_health("node-old")).await.unwrap());
        assert_eq!(queue_items(&fx, &fx.keys.node_queue("node-a")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_without_live_nodes_work_is_parked() {
        let fx = fixture("node-a", RecoveryPolicy::default());
        ghost(&fx, "node-dead", chrono::Duration::minutes(10)).await;
        load_dead_node(&fx, "node-dead", 1, 2).await;

        let report = fx.detector.cleanup_stale_nodes().await;

        assert_eq!(report.items_parked, 3);
        assert_eq!(report.items_redistributed, 0);
        let parked = queue_items(&fx, &fx.keys.global_queue()).await;
        assert_eq!(parked.len(), 3);
        assert!(parked
            .iter()
            .all(|item| item.assigned_node.is_none() && item.status == WorkStatus::Pending));
        assert!(!fx.store.exists(&fx.keys.active("node-dead")).await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_and_own_nodes_are_not_candidates() {
        let fx = fixture("node-self", RecoveryPolicy::default());
        ghost(&fx, "node-self", chrono::Duration::minutes(10)).await;
        heartbeat(&fx, "node-b", chrono::Duration::minutes(4)).await;

        assert!(fx.detector.stale_nodes(Utc::now()).await.is_empty());
        assert_eq!(fx.detector.cleanup_stale_nodes().await, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recovery_lock_held_elsewhere_skips_node() {
        let fx = fixture("node-a", RecoveryPolicy::default());
        ghost(&fx, "node-dead", chrono::Duration::minutes(10)).await;
        load_dead_node(&fx, "node-dead", 1, 0).await;

        let rival = LockManager::new(Arc::new(fx.store.clone()), fx.keys.clone(), "node-rival");
        assert!(rival.acquire(&KeySpace::recovery_lock_name("node-dead"), Duration::from_secs(60)).await);

        let report = fx.detector.cleanup_stale_nodes().await;
        assert_eq!(report.nodes_cleaned, 0);
        assert_eq!(report.nodes_skipped, vec!["node-dead".to_string()]);
        assert!(fx.store.exists(&fx.keys.active("node-dead")).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_exclusive_recovery_ignores_lock() {
        let fx = fixture(
            "node-a",
            RecoveryPolicy {
                exclusive: false,
                ..RecoveryPolicy::default()
            },
        );
        ghost(&fx, "node-dead", chrono::Duration::minutes(10)).await;
        load_dead_node(&fx, "node-dead", 1, 0).await;
        let rival = LockManager::new(Arc::new(fx.store.clone()), fx.keys.clone(), "node-rival");
        assert!(rival.acquire(&KeySpace::recovery_lock_name("node-dead"), Duration::from_secs(60)).await);

        let report = fx.detector.cleanup_stale_nodes().await;
        assert_eq!(report.nodes_cleaned, 1);
        assert_eq!(report.items_parked, 1);
    }

    #[tokio::test]
    async fn test_second_pass_finds_nothing() {
        let fx = fixture("node-a", RecoveryPolicy::default());
        heartbeat(&fx, "node-a", chrono::Duration::seconds(1)).await;
        ghost(&fx, "node-dead", chrono::Duration::minutes(10)).await;
        load_dead_node(&fx, "node-dead", 2, 2).await;

        assert_eq!(fx.detector.cleanup_stale_nodes().await.nodes_cleaned, 1);
        assert_eq!(fx.detector.cleanup_stale_nodes().await, RecoveryReport::default());
        assert_eq!(queue_items(&fx, &fx.keys.node_queue("node-a")).await.len(), 4);
    }
}
