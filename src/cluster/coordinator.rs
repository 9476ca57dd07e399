//! The per-node coordinator object and graceful shutdown.
//!
//! A [`Coordinator`] is built once per process from a [`ClusterConfig`] and
//! owns every component of this node: locks, distribution, lifecycle, health
//! monitor, failure detector and status aggregator, all sharing one store
//! handle and one node identity.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::distribution::{DistributionResult, WorkDistributor};
use super::health::{
    HealthCounters, HealthMonitor, HealthStatus, NodeDirectory, ResourceProbe, SystemProbe,
};
use super::keys::KeySpace;
use super::lifecycle::{parse_items, WorkLifecycle};
use super::lock::LockManager;
use super::recovery::{park_items, FailureDetector, RecoveryReport};
use super::redis_store::RedisStore;
use super::status::{ClusterStatus, StatusAggregator};
use super::store::CoordinationStore;
use super::work_item::{RetryRecord, WorkItem};
use crate::config::ClusterConfig;
use crate::error::{CoordinatorError, CoordinatorResult};

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub node_id: String,
    /// Whether the health monitor exited within its stop timeout.
    pub monitor_stopped: bool,
    /// In-flight items returned to the global pool.
    pub active_requeued: usize,
    /// Not yet started items returned to the global pool.
    pub pending_requeued: usize,
    /// Whether all node keys were removed. False leaves recovery to the
    /// failure detector of another node.
    pub clean: bool,
}

/// Generates a node id from the host name, the current unix time and a
/// random suffix.
pub fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, Utc::now().timestamp(), &suffix[..8])
}

/// Coordination entry point of one node.
pub struct Coordinator {
    config: ClusterConfig,
    node_id: String,
    keys: KeySpace,
    store: Arc<dyn CoordinationStore>,
    locks: LockManager,
    directory: NodeDirectory,
    distributor: WorkDistributor,
    lifecycle: WorkLifecycle,
    detector: FailureDetector,
    status: StatusAggregator,
    monitor: HealthMonitor,
}

impl Coordinator {
    /// Connects to Redis at `config.redis_url` and builds the coordinator.
    pub async fn connect(config: ClusterConfig) -> CoordinatorResult<Self> {
        config.validate()?;

        let store = RedisStore::connect(&config.redis_url)
            .await
            .map_err(|source| CoordinatorError::Connection {
                url: config.redis_url.clone(),
                source,
            })?;
        store
            .ping()
            .await
            .map_err(|source| CoordinatorError::Connection {
                url: config.redis_url.clone(),
                source,
            })?;

        info!(redis_url = %config.redis_url, "Connected to coordination store");
        Self::with_store(Arc::new(store), config)
    }

    /// Builds the coordinator over an existing store, sampling host resources.
    pub fn with_store(
        store: Arc<dyn CoordinationStore>,
        config: ClusterConfig,
    ) -> CoordinatorResult<Self> {
        Self::with_probe(store, config, Arc::new(SystemProbe::new()))
    }

    /// Builds the coordinator over an existing store and resource probe.
    pub fn with_probe(
        store: Arc<dyn CoordinationStore>,
        config: ClusterConfig,
        probe: Arc<dyn ResourceProbe>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;

        let node_id = config.node_id.clone().unwrap_or_else(generate_node_id);
        let keys = KeySpace::new(config.key_prefix.clone());
        let counters = Arc::new(HealthCounters::default());

        let locks = LockManager::new(Arc::clone(&store), keys.clone(), node_id.clone());
        let directory =
            NodeDirectory::new(Arc::clone(&store), keys.clone(), config.health_freshness);
        let distributor =
            WorkDistributor::new(Arc::clone(&store), keys.clone(), directory.clone());
        let lifecycle = WorkLifecycle::new(
            Arc::clone(&store),
            keys.clone(),
            node_id.clone(),
            config.lifecycle_policy(),
            Arc::clone(&counters),
        );
        let detector = FailureDetector::new(
            Arc::clone(&store),
            keys.clone(),
            node_id.clone(),
            directory.clone(),
            distributor.clone(),
            locks.clone(),
            config.recovery_policy(),
        );
        let status = StatusAggregator::new(Arc::clone(&store), keys.clone(), directory.clone());
        let monitor = HealthMonitor::new(
            Arc::clone(&store),
            keys.clone(),
            node_id.clone(),
            config.heartbeat_interval,
            probe,
            counters,
        )
        .with_stop_timeout(config.shutdown_timeout);

        info!(node_id = %node_id, prefix = %keys.prefix(), "Coordinator ready");

        Ok(Self {
            config,
            node_id,
            keys,
            store,
            locks,
            directory,
            distributor,
            lifecycle,
            detector,
            status,
            monitor,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // Work distribution and lifecycle

    /// Spreads `items` over the healthy nodes.
    pub async fn distribute(&self, items: Vec<WorkItem>) -> DistributionResult {
        self.distributor.distribute(items).await
    }

    /// Pulls up to `count` items from this node's queue.
    pub async fn pull(&self, count: usize) -> Vec<WorkItem> {
        self.lifecycle.pull(&self.node_id, count).await
    }

    pub async fn complete(&self, item: &mut WorkItem) -> bool {
        self.lifecycle.complete(item).await
    }

    pub async fn fail(&self, item: &mut WorkItem, error_message: &str) -> bool {
        self.lifecycle.fail(item, error_message).await
    }

    pub async fn discard(&self, item: &WorkItem) -> bool {
        self.lifecycle.discard(item).await
    }

    pub async fn drain_retry_queue(&self) -> Vec<WorkItem> {
        self.lifecycle.drain_retry_queue().await
    }

    pub async fn active_items(&self) -> Vec<WorkItem> {
        self.lifecycle.active_items(&self.node_id).await
    }

    pub async fn claim_unassigned(&self, count: usize) -> usize {
        self.lifecycle.claim_unassigned(count).await
    }

    /// Redistributes due retries and everything parked on the global pool.
    ///
    /// Items that still find no node go back onto the pool. If even that
    /// fails, each item is returned to the retry set or pool it came from.
    pub async fn requeue_pending(&self) -> DistributionResult {
        let mut items = self.drain_retry_queue().await;
        let from_retries: HashSet<String> =
            items.iter().map(|item| item.work_id.clone()).collect();
        items.extend(self.drain_global_pool().await);

        if items.is_empty() {
            return DistributionResult::default();
        }

        let placement = self.distributor.place(items).await;
        if !park_items(self.store.as_ref(), &self.keys, &placement.undelivered).await {
            warn!(
                count = placement.undelivered.len(),
                "Failed to park undelivered items, restoring them to their sources"
            );
            self.restore_unplaced(&placement.undelivered, &from_retries)
                .await;
        }
        placement.result
    }

    /// Puts drained items back where they were taken from. Retries become due
    /// immediately; pool items return to the pop end of the pool.
    async fn restore_unplaced(&self, items: &[WorkItem], from_retries: &HashSet<String>) {
        let pool = self.keys.global_queue();
        let retry_queue = self.keys.retry_queue();
        let now = Utc::now();

        for item in items {
            let restored = if from_retries.contains(&item.work_id) {
                let record = RetryRecord {
                    item: item.clone(),
                    retry_time: now,
                };
                match serde_json::to_string(&record) {
                    Ok(member) => self
                        .store
                        .sorted_add(&retry_queue, &member, record.score())
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            } else {
                match serde_json::to_string(item) {
                    Ok(payload) => self
                        .store
                        .push_right(&pool, &payload)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            };
            if let Err(e) = restored {
                error!(work_id = %item.work_id, error = %e, "Lost drained item while restoring it");
            }
        }
    }

    async fn drain_global_pool(&self) -> Vec<WorkItem> {
        let pool = self.keys.global_queue();
        let mut raw = Vec::new();
        loop {
            match self.store.pop(&pool).await {
                Ok(Some(entry)) => raw.push(entry),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to drain global pool");
                    break;
                }
            }
        }
        parse_items(raw.iter())
    }

    /// Acquires the lock of `work_id` with the configured TTL.
    pub async fn acquire_lock(&self, work_id: &str) -> bool {
        self.locks.acquire(work_id, self.config.lock_ttl).await
    }

    pub async fn release_lock(&self, work_id: &str) -> bool {
        self.locks.release(work_id).await
    }

    // Health, recovery and status

    pub async fn healthy_nodes(&self) -> Vec<String> {
        self.directory.healthy_nodes().await
    }

    pub fn start_health_monitor(&self) {
        self.monitor.set_standby(false);
        self.monitor.start();
    }

    /// Heartbeats as `OFFLINE`: the node stays visible and is not declared
    /// stale, but `distribute` never assigns it work.
    pub fn start_standby_monitor(&self) {
        self.monitor.set_standby(true);
        self.monitor.start();
    }

    pub async fn stop_health_monitor(&self) -> bool {
        self.monitor.stop().await
    }

    pub async fn heartbeat_once(&self) -> Option<HealthStatus> {
        self.monitor.heartbeat_once().await
    }

    pub async fn cleanup_stale_nodes(&self) -> RecoveryReport {
        self.detector.cleanup_stale_nodes().await
    }

    pub async fn cluster_status(&self) -> ClusterStatus {
        self.status.cluster_status().await
    }

    /// Leaves the cluster: stops heartbeating and hands all local work back
    /// to the global pool.
    ///
    /// When the work cannot be parked the node keys stay in place and an
    /// `OFFLINE` record is published; another node's failure detector then
    /// recovers the work once the registry entry goes stale.
    pub async fn coordinate_shutdown(&self) -> ShutdownReport {
        info!(node_id = %self.node_id, "Coordinating shutdown");
        let mut report = ShutdownReport {
            node_id: self.node_id.clone(),
            monitor_stopped: self.monitor.stop().await,
            ..ShutdownReport::default()
        };

        let active_key = self.keys.active(&self.node_id);
        let queue_key = self.keys.node_queue(&self.node_id);

        let active = match self.store.hash_get_all(&active_key).await {
            Ok(active) => parse_items(active.values()),
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to read active work on shutdown");
                self.monitor.mark_offline().await;
                return report;
            }
        };
        let pending = match self.store.list_all(&queue_key).await {
            Ok(queued) => parse_items(queued.iter().rev()),
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to read work queue on shutdown");
                self.monitor.mark_offline().await;
                return report;
            }
        };

        let (active_count, pending_count) = (active.len(), pending.len());
        let items: Vec<WorkItem> = active
            .into_iter()
            .chain(pending)
            .map(|mut item| {
                item.reset_for_redistribution();
                item
            })
            .collect();

        if !park_items(self.store.as_ref(), &self.keys, &items).await {
            self.monitor.mark_offline().await;
            return report;
        }
        report.active_requeued = active_count;
        report.pending_requeued = pending_count;

        let doomed = vec![active_key, queue_key, self.keys.node_health(&self.node_id)];
        match self.store.delete(&doomed).await {
            Ok(()) => report.clean = true,
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Failed to delete node keys on shutdown")
            }
        }
        if report.clean {
            if let Err(e) = self
                .store
                .sorted_remove(&self.keys.node_registry(), &self.node_id)
                .await
            {
                warn!(node_id = %self.node_id, error = %e, "Failed to leave node registry");
                report.clean = false;
            }
        }

        info!(
            node_id = %self.node_id,
            active_requeued = report.active_requeued,
            pending_requeued = report.pending_requeued,
            clean = report.clean,
            "Shutdown complete"
        );
        report
    }
}
