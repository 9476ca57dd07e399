//! Per-node work lifecycle: pull, complete, fail and retry scheduling.
//!
//! A pulled item is written into the node's active hash as soon as it leaves
//! the queue, so a crash between pop and processing still leaves a trace the
//! failure detector can recover. Completed items move into a completed hash
//! that expires after a retention period; failed items either enter the
//! global retry set with exponential backoff or, once their retry budget is
//! spent, the node's failed hash.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::health::HealthCounters;
use super::keys::KeySpace;
use super::store::{CoordinationStore, StoreError};
use super::work_item::{
    timestamp_score, FailureOutcome, RetryRecord, WorkItem, BACKOFF_BASE, BACKOFF_CAP,
};
use crate::metrics::MetricsCollector;

/// Default retention of completed work history.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Retention and backoff settings of the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub completed_retention: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }
}

/// Moves work items of one node through their lifecycle.
#[derive(Clone)]
pub struct WorkLifecycle {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    node_id: String,
    policy: LifecyclePolicy,
    counters: Arc<HealthCounters>,
    metrics: MetricsCollector,
}

impl WorkLifecycle {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        node_id: impl Into<String>,
        policy: LifecyclePolicy,
        counters: Arc<HealthCounters>,
    ) -> Self {
        Self {
            store,
            keys,
            node_id: node_id.into(),
            policy,
            counters,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Pops up to `count` items from `node_id`'s queue and marks them in progress.
    ///
    /// Returns early when the queue runs dry; an empty result is not an error.
    pub async fn pull(&self, node_id: &str, count: usize) -> Vec<WorkItem> {
        let queue = self.keys.node_queue(node_id);
        let active = self.keys.active(node_id);
        let mut pulled = Vec::with_capacity(count);

        while pulled.len() < count {
            let raw = match self.store.pop(&queue).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(node_id, error = %e, "Failed to pop work queue");
                    break;
                }
            };

            let mut item: WorkItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(node_id, error = %e, "Dropping unparseable queue entry");
                    continue;
                }
            };

            item.start(Utc::now());
            if item.assigned_node.is_none() {
                item.assigned_node = Some(node_id.to_string());
            }

            let written = match serde_json::to_string(&item) {
                Ok(payload) => self
                    .store
                    .hash_set(&active, &item.work_id, &payload)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            if let Err(e) = written {
                error!(node_id, work_id = %item.work_id, error = %e, "Failed to record active work, returning item to queue");
                if let Err(e) = self.store.push_right(&queue, &raw).await {
                    error!(node_id, work_id = %item.work_id, error = %e, "Failed to return item to queue");
                }
                break;
            }

            debug!(node_id, work_id = %item.work_id, "Pulled work item");
            pulled.push(item);
        }

        pulled
    }

    /// Marks `item` completed and moves it into its node's completed history.
    ///
    /// The history entry is written before the active entry is removed. If
    /// the write fails the item stays active, `item` is left unchanged and
    /// false is returned.
    pub async fn complete(&self, item: &mut WorkItem) -> bool {
        let previous = item.clone();
        if !item.complete(Utc::now()) {
            warn!(work_id = %item.work_id, status = %item.status, "Refusing to complete terminal item");
            return false;
        }

        let node = self.owner_of(item);
        let completed_key = self.keys.completed(&node);
        let recorded = match serde_json::to_string(item) {
            Ok(payload) => self
                .store
                .hash_set(&completed_key, &item.work_id, &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = recorded {
            error!(node_id = %node, work_id = %item.work_id, error = %e, "Failed to record completion, item stays active");
            *item = previous;
            return false;
        }

        if let Err(e) = self
            .store
            .expire(&completed_key, self.policy.completed_retention)
            .await
        {
            warn!(node_id = %node, error = %e, "Failed to set completed history expiry");
        }
        self.clear_active(&node, &item.work_id).await;

        self.metrics.record_completed();
        info!(
            node_id = %node,
            work_id = %item.work_id,
            age_secs = item.age().num_seconds(),
            "Work item completed"
        );
        true
    }

    /// Records a failure of `item`, scheduling a retry or marking it failed.
    ///
    /// Like `complete`, the retry record or failed entry is written first;
    /// on a write error the item stays active and `item` is left unchanged.
    pub async fn fail(&self, item: &mut WorkItem, error_message: &str) -> bool {
        self.fail_at(item, error_message, Utc::now()).await
    }

    async fn fail_at(&self, item: &mut WorkItem, error_message: &str, now: DateTime<Utc>) -> bool {
        let previous = item.clone();
        let outcome = item.record_failure_with(
            error_message,
            self.policy.backoff_base,
            self.policy.backoff_cap,
        );

        let node = self.owner_of(item);
        let stored = match outcome {
            FailureOutcome::Ignored => {
                warn!(work_id = %item.work_id, status = %item.status, "Refusing to fail terminal item");
                return false;
            }
            FailureOutcome::Retry { delay } => self.schedule_retry(item, delay, now).await,
            FailureOutcome::Exhausted => self.record_failed(&node, item).await,
        };
        self.counters.record_error();

        if let Err(e) = stored {
            error!(node_id = %node, work_id = %item.work_id, error = %e, "Failed to record failure, item stays active");
            *item = previous;
            return false;
        }
        self.clear_active(&node, &item.work_id).await;

        match outcome {
            FailureOutcome::Retry { delay } => {
                self.metrics.record_failure(true);
                warn!(
                    node_id = %node,
                    work_id = %item.work_id,
                    retry_count = item.retry_count,
                    delay_secs = delay.as_secs(),
                    error = error_message,
                    "Work item failed, retry scheduled"
                );
            }
            _ => {
                self.metrics.record_failure(false);
                error!(
                    node_id = %node,
                    work_id = %item.work_id,
                    retry_count = item.retry_count,
                    error = error_message,
                    "Work item failed permanently"
                );
            }
        }
        true
    }

    async fn schedule_retry(
        &self,
        item: &WorkItem,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = RetryRecord {
            item: item.clone(),
            retry_time: now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        let member = serde_json::to_string(&record)?;
        self.store
            .sorted_add(&self.keys.retry_queue(), &member, record.score())
            .await
    }

    async fn record_failed(&self, node: &str, item: &WorkItem) -> Result<(), StoreError> {
        let payload = serde_json::to_string(item)?;
        self.store
            .hash_set(&self.keys.failed(node), &item.work_id, &payload)
            .await
    }

    /// A leftover active entry only means the item may be recovered and run
    /// again; its outcome is already recorded.
    async fn clear_active(&self, node: &str, work_id: &str) {
        if let Err(e) = self.store.hash_delete(&self.keys.active(node), work_id).await {
            warn!(node_id = %node, work_id, error = %e, "Failed to clear active entry");
        }
    }

    /// Drops a pulled item from the active hash without changing its state.
    ///
    /// Used when another node already holds the item's lock.
    pub async fn discard(&self, item: &WorkItem) -> bool {
        let node = self.owner_of(item);
        match self
            .store
            .hash_delete(&self.keys.active(&node), &item.work_id)
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                warn!(node_id = %node, work_id = %item.work_id, error = %e, "Failed to discard active item");
                false
            }
        }
    }

    /// Removes and returns every retry that is due now.
    pub async fn drain_retry_queue(&self) -> Vec<WorkItem> {
        self.drain_retry_queue_until(Utc::now()).await
    }

    /// Removes and returns every retry scheduled at or before `cutoff`.
    ///
    /// Items keep their `RETRYING` status; placing them is up to the caller.
    pub async fn drain_retry_queue_until(&self, cutoff: DateTime<Utc>) -> Vec<WorkItem> {
        let members = match self
            .store
            .sorted_pop_until(&self.keys.retry_queue(), timestamp_score(cutoff))
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "Failed to drain retry queue");
                return Vec::new();
            }
        };

        let items: Vec<WorkItem> = members
            .iter()
            .filter_map(|raw| match serde_json::from_str::<RetryRecord>(raw) {
                Ok(record) => Some(record.item),
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable retry record");
                    None
                }
            })
            .collect();

        if !items.is_empty() {
            info!(count = items.len(), "Drained due retries");
        }
        items
    }

    /// Returns the retries that are scheduled but not yet drained.
    pub async fn scheduled_retries(&self) -> Vec<RetryRecord> {
        match self
            .store
            .sorted_range_until(&self.keys.retry_queue(), f64::INFINITY)
            .await
        {
            Ok(members) => members
                .iter()
                .filter_map(|(raw, _)| serde_json::from_str(raw).ok())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read retry queue");
                Vec::new()
            }
        }
    }

    /// Returns the in-flight items of `node_id`.
    pub async fn active_items(&self, node_id: &str) -> Vec<WorkItem> {
        match self.store.hash_get_all(&self.keys.active(node_id)).await {
            Ok(entries) => parse_items(entries.values()),
            Err(e) => {
                warn!(node_id, error = %e, "Failed to read active work");
                Vec::new()
            }
        }
    }

    /// Moves up to `count` items from the unassigned pool onto this node's queue.
    pub async fn claim_unassigned(&self, count: usize) -> usize {
        let pool = self.keys.global_queue();
        let queue = self.keys.node_queue(&self.node_id);
        let mut claimed = 0;

        while claimed < count {
            let raw = match self.store.pop(&pool).await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to pop unassigned pool");
                    break;
                }
            };

            let mut item: WorkItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable pool entry");
                    continue;
                }
            };
            item.assign(&self.node_id);

            let pushed = match serde_json::to_string(&item) {
                Ok(payload) => self.store.push(&queue, &payload).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = pushed {
                error!(work_id = %item.work_id, error = %e, "Failed to claim item, returning it to the pool");
                if let Err(e) = self.store.push_right(&pool, &raw).await {
                    error!(work_id = %item.work_id, error = %e, "Failed to return item to the pool");
                }
                break;
            }
            claimed += 1;
        }

        if claimed > 0 {
            info!(node_id = %self.node_id, claimed, "Claimed unassigned work");
        }
        claimed
    }

    fn owner_of(&self, item: &WorkItem) -> String {
        item.assigned_node
            .clone()
            .unwrap_or_else(|| self.node_id.clone())
    }
}

/// Parses stored item payloads, skipping corrupt ones.
pub(crate) fn parse_items<'a>(raw: impl IntoIterator<Item = &'a String>) -> Vec<WorkItem> {
    raw.into_iter()
        .filter_map(|payload| match serde_json::from_str::<WorkItem>(payload) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable work item");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory_store::MemoryStore;
    use crate::cluster::testing::FaultyStore;
    use crate::cluster::work_item::WorkStatus;

    fn lifecycle(store: &MemoryStore) -> WorkLifecycle {
        WorkLifecycle::new(
            Arc::new(store.clone()),
            KeySpace::default(),
            "node-a",
            LifecyclePolicy::default(),
            Arc::new(HealthCounters::default()),
        )
    }

    async fn enqueue(store: &MemoryStore, node: &str, id: &str) {
        let mut item = WorkItem::new(id, "Vienna", format!("https://example.com/{}", id));
        item.assign(node);
        store
            .push(
                &KeySpace::default().node_queue(node),
                &serde_json::to_string(&item).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pull_is_fifo_and_tracks_active() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        for id in ["w-1", "w-2", "w-3"] {
            enqueue(&store, "node-a", id).await;
        }
        let manager = lifecycle(&store);

        let pulled = manager.pull("node-a", 2).await;

        assert_eq!(
            pulled.iter().map(|i| i.work_id.as_str()).collect::<Vec<_>>(),
            vec!["w-1", "w-2"]
        );
        assert!(pulled
            .iter()
            .all(|i| i.status == WorkStatus::InProgress && i.started_at.is_some()));
        assert_eq!(store.hash_len(&keys.active("node-a")).await.unwrap(), 2);
        assert_eq!(store.list_len(&keys.node_queue("node-a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pull_from_empty_queue() {
        let store = MemoryStore::new();
        assert!(lifecycle(&store).pull("node-a", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_skips_corrupt_entries() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        store.push(&keys.node_queue("node-a"), "{garbage").await.unwrap();
        enqueue(&store, "node-a", "w-1").await;

        let pulled = lifecycle(&store).pull("node-a", 5).await;
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].work_id, "w-1");
    }

    #[tokio::test]
    async fn test_complete_moves_to_history() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let manager = lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);

        assert!(manager.complete(&mut item).await);

        assert_eq!(item.status, WorkStatus::Completed);
        assert!(item.completed_at.is_some());
        assert_eq!(store.hash_len(&keys.active("node-a")).await.unwrap(), 0);
        assert!(store
            .hash_get(&keys.completed("node-a"), "w-1")
            .await
            .unwrap()
            .is_some());
        let ttl = store.ttl(&keys.completed("node-a")).expect("history expires");
        assert!(ttl > Duration::from_secs(23 * 60 * 60));

        assert!(!manager.complete(&mut item).await);
    }

    #[tokio::test]
    async fn test_first_failure_schedules_retry_in_sixty_seconds() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let manager = lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);
        let now = Utc::now();

        assert!(manager.fail_at(&mut item, "captcha", now).await);

        assert_eq!(item.retry_count, 1);
        assert_eq!(item.status, WorkStatus::Retrying);
        assert_eq!(store.hash_len(&keys.active("node-a")).await.unwrap(), 0);

        let scheduled = manager.scheduled_retries().await;
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].retry_time - now, chrono::Duration::seconds(60));
        assert_eq!(scheduled[0].item.error_message.as_deref(), Some("captcha"));
    }

    #[tokio::test]
    async fn test_exhausted_item_goes_to_failed_hash() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let manager = lifecycle(&store);
        let mut item = WorkItem::new("w-1", "Vienna", "https://example.com");
        item.assign("node-a");
        item.start(Utc::now());
        item.retry_count = 3;

        assert!(manager.fail(&mut item, "blocked").await);

        assert_eq!(item.status, WorkStatus::Failed);
        assert!(store
            .hash_get(&keys.failed("node-a"), "w-1")
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.sorted_len(&keys.retry_queue()).await.unwrap(), 0);
        assert!(!manager.fail(&mut item, "again").await);
    }

    #[tokio::test]
    async fn test_successive_failures_back_off() {
        let store = MemoryStore::new();
        let manager = lifecycle(&store);
        let mut item = WorkItem::new("w-1", "Vienna", "https://example.com").with_max_retries(10);
        item.assign("node-a");
        let now = Utc::now();
        let mut previous = chrono::Duration::zero();

        for _ in 0..8 {
            item.start(now);
            assert!(manager.fail_at(&mut item, "flaky", now).await);
            let retry = manager.drain_retry_queue_until(now + chrono::Duration::hours(1)).await;
            assert_eq!(retry.len(), 1);
            item = retry.into_iter().next().unwrap();

            let delay = chrono::Duration::from_std(
                crate::cluster::work_item::retry_delay(item.retry_count),
            )
            .unwrap();
            assert!(delay >= previous);
            assert!(delay <= chrono::Duration::seconds(300));
            previous = delay;
        }
    }

    #[tokio::test]
    async fn test_drain_returns_only_due_items() {
        let store = MemoryStore::new();
        let manager = lifecycle(&store);
        let now = Utc::now();

        let mut soon = WorkItem::new("soon", "Vienna", "https://example.com/1");
        soon.assign("node-a");
        let mut later = WorkItem::new("later", "Vienna", "https://example.com/2").with_max_retries(9);
        later.assign("node-a");
        later.retry_count = 5;

        assert!(manager.fail_at(&mut soon, "e", now).await);
        assert!(manager.fail_at(&mut later, "e", now).await);

        assert!(manager.drain_retry_queue_until(now).await.is_empty());

        let due = manager
            .drain_retry_queue_until(now + chrono::Duration::seconds(61))
            .await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].work_id, "soon");
        assert_eq!(due[0].status, WorkStatus::Retrying);

        assert!(manager
            .drain_retry_queue_until(now + chrono::Duration::seconds(61))
            .await
            .is_empty());
        assert_eq!(manager.scheduled_retries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_unassigned() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        let item = WorkItem::new("w-1", "Vienna", "https://example.com");
        store
            .push(&keys.global_queue(), &serde_json::to_string(&item).unwrap())
            .await
            .unwrap();
        let manager = lifecycle(&store);

        assert_eq!(manager.claim_unassigned(10).await, 1);
        let pulled = manager.pull("node-a", 1).await;
        assert_eq!(pulled[0].assigned_node.as_deref(), Some("node-a"));
        assert_eq!(manager.active_items("node-a").await.len(), 1);
    }

    fn faulty_lifecycle(store: &MemoryStore) -> (WorkLifecycle, FaultyStore) {
        let faulty = FaultyStore::new(store.clone());
        let manager = WorkLifecycle::new(
            Arc::new(faulty.clone()),
            KeySpace::default(),
            "node-a",
            LifecyclePolicy::default(),
            Arc::new(HealthCounters::default()),
        );
        (manager, faulty)
    }

    fn ids(items: &[WorkItem]) -> Vec<&str> {
        items.iter().map(|i| i.work_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_pull_keeps_fifo_when_active_write_fails() {
        let store = MemoryStore::new();
        for id in ["w-1", "w-2", "w-3"] {
            enqueue(&store, "node-a", id).await;
        }
        let (manager, faulty) = faulty_lifecycle(&store);
        faulty.fail_times("hash_set", 1);

        assert!(manager.pull("node-a", 3).await.is_empty());

        let pulled = manager.pull("node-a", 3).await;
        assert_eq!(ids(&pulled), vec!["w-1", "w-2", "w-3"]);
    }

    #[tokio::test]
    async fn test_failed_completion_write_keeps_item_active() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let (manager, faulty) = faulty_lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);
        faulty.fail_on_key("hash_set", "completed_work");

        assert!(!manager.complete(&mut item).await);

        assert_eq!(item.status, WorkStatus::InProgress);
        assert!(item.completed_at.is_none());
        assert!(store.hash_get(&keys.active("node-a"), "w-1").await.unwrap().is_some());
        assert_eq!(store.hash_len(&keys.completed("node-a")).await.unwrap(), 0);

        faulty.heal();
        assert!(manager.complete(&mut item).await);
        assert_eq!(store.hash_len(&keys.active("node-a")).await.unwrap(), 0);
        assert_eq!(store.hash_len(&keys.completed("node-a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_retry_write_keeps_item_active() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let (manager, faulty) = faulty_lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);
        faulty.fail("sorted_add");

        assert!(!manager.fail(&mut item, "timeout").await);

        assert_eq!(item.retry_count, 0);
        assert_eq!(item.status, WorkStatus::InProgress);
        assert!(item.error_message.is_none());
        assert!(store.hash_get(&keys.active("node-a"), "w-1").await.unwrap().is_some());
        assert_eq!(store.sorted_len(&keys.retry_queue()).await.unwrap(), 0);

        faulty.heal();
        assert!(manager.fail(&mut item, "timeout").await);
        assert_eq!(item.retry_count, 1);
        assert_eq!(store.sorted_len(&keys.retry_queue()).await.unwrap(), 1);
        assert_eq!(store.hash_len(&keys.active("node-a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_permanent_failure_write_keeps_item_active() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let (manager, faulty) = faulty_lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);
        item.retry_count = 2;
        faulty.fail_on_key("hash_set", "failed_work");

        assert!(!manager.fail(&mut item, "blocked").await);

        assert_eq!(item.retry_count, 2);
        assert_eq!(item.status, WorkStatus::InProgress);
        assert!(store.hash_get(&keys.active("node-a"), "w-1").await.unwrap().is_some());
        assert_eq!(store.hash_len(&keys.failed("node-a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completion_survives_active_cleanup_error() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        enqueue(&store, "node-a", "w-1").await;
        let (manager, faulty) = faulty_lifecycle(&store);
        let mut item = manager.pull("node-a", 1).await.remove(0);
        faulty.fail("hash_delete");

        assert!(manager.complete(&mut item).await);
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(store.hash_len(&keys.completed("node-a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_returns_item_to_pool_head_on_error() {
        let store = MemoryStore::new();
        let keys = KeySpace::default();
        for id in ["p-1", "p-2"] {
            let item = WorkItem::new(id, "Vienna", "https://example.com");
            store
                .push(&keys.global_queue(), &serde_json::to_string(&item).unwrap())
                .await
                .unwrap();
        }
        let (manager, faulty) = faulty_lifecycle(&store);
        faulty.fail_on_key("push", "work_queue:node-a");

        assert_eq!(manager.claim_unassigned(2).await, 0);

        let head = store.pop(&keys.global_queue()).await.unwrap().unwrap();
        let head: WorkItem = serde_json::from_str(&head).unwrap();
        assert_eq!(head.work_id, "p-1");
        assert_eq!(store.list_len(&keys.global_queue()).await.unwrap(), 1);
    }
}
