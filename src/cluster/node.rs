//! Driver loop of one node.
//!
//! The runner heartbeats through the coordinator's health monitor, pulls and
//! processes one item at a time under its work lock, renewing the lock while
//! the processor runs, and periodically runs failure detection and retry
//! requeueing. Processing itself is delegated to
//! a [`WorkProcessor`] supplied by the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::error::Elapsed;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::coordinator::{Coordinator, ShutdownReport};
use super::work_item::WorkItem;
use crate::metrics::MetricsCollector;

/// Attempts at storing an item's outcome before it is left for recovery.
const RECORD_ATTEMPTS: u32 = 3;

/// Processes one work item, e.g. scrapes the item's URL.
#[async_trait]
pub trait WorkProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> anyhow::Result<()>;
}

/// Statistics of a running node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerStats {
    pub items_completed: u64,
    pub items_failed: u64,
    /// Items skipped because another node held their lock.
    pub items_skipped: u64,
    pub average_duration: Duration,
}

impl RunnerStats {
    /// Returns the number of items processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

#[derive(Default)]
struct SharedStats {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn record(&self, success: bool, duration: Duration) {
        let counter = if success { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self) -> RunnerStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };

        RunnerStats {
            items_completed: completed,
            items_failed: failed,
            items_skipped: self.skipped.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

/// Runs the work loop of one node until shut down.
#[derive(Clone)]
pub struct NodeRunner {
    coordinator: Arc<Coordinator>,
    processor: Arc<dyn WorkProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    process_timeout: Duration,
    stats: Arc<SharedStats>,
    metrics: MetricsCollector,
}

impl NodeRunner {
    /// Processing is bounded by the work lock TTL unless overridden.
    pub fn new(coordinator: Arc<Coordinator>, processor: Arc<dyn WorkProcessor>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let process_timeout = coordinator.config().lock_ttl;

        Self {
            coordinator,
            processor,
            shutdown_tx,
            process_timeout,
            stats: Arc::new(SharedStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    /// Returns a receiver to pass to [`NodeRunner::run`].
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Asks every running loop to stop after its current item.
    pub fn shutdown(&self) {
        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot()
    }

    /// Main loop. Returns once a shutdown signal arrives and the node has
    /// handed its remaining work back to the cluster.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> ShutdownReport {
        let coordinator = &self.coordinator;
        let node_id = coordinator.node_id().to_string();
        let cleanup_interval = coordinator.config().cleanup_interval;
        let poll_interval = coordinator.config().poll_interval;

        info!(node_id = %node_id, "Node runner started");
        coordinator.start_health_monitor();
        let mut last_maintenance: Option<Instant> = None;

        loop {
            // Check for shutdown signal (non-blocking)
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(node_id = %node_id, "Node runner received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if last_maintenance.map_or(true, |at| at.elapsed() >= cleanup_interval) {
                self.maintenance().await;
                last_maintenance = Some(Instant::now());
            }

            if let Some(item) = coordinator.pull(1).await.into_iter().next() {
                self.process_item(item).await;
                continue;
            }

            if coordinator.claim_unassigned(1).await > 0 {
                continue;
            }

            debug!(node_id = %node_id, "No work available");
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node_id = %node_id, "Node runner received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        let report = coordinator.coordinate_shutdown().await;
        info!(node_id = %node_id, "Node runner stopped");
        report
    }

    /// Failure detection followed by retry and pool requeueing.
    async fn maintenance(&self) {
        let report = self.coordinator.cleanup_stale_nodes().await;
        if report.nodes_cleaned > 0 {
            info!(
                nodes_cleaned = report.nodes_cleaned,
                items_recovered = report.items_recovered,
                "Recovered work from dead nodes"
            );
        }

        let requeued = self.coordinator.requeue_pending().await;
        if requeued.total > 0 {
            info!(
                distributed = requeued.distributed,
                failed = requeued.failed,
                "Requeued retries and unassigned work"
            );
        }
    }

    async fn process_item(&self, mut item: WorkItem) {
        let coordinator = &self.coordinator;
        let work_id = item.work_id.clone();

        if !coordinator.acquire_lock(&work_id).await {
            warn!(work_id = %work_id, "Work item locked by another node, skipping");
            coordinator.discard(&item).await;
            self.stats.skipped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        info!(
            work_id = %work_id,
            city = %item.city,
            attempt = item.retry_count + 1,
            "Processing work item"
        );

        let start_time = Instant::now();
        let outcome = self.process_with_renewal(&item).await;
        let duration = start_time.elapsed();
        self.metrics.record_processing(duration.as_secs_f64());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some(format!("Processing timed out after {:?}", self.process_timeout)),
        };
        self.stats.record(failure.is_none(), duration);

        if !self.record_outcome(&mut item, failure.as_deref()).await {
            error!(
                work_id = %work_id,
                attempts = RECORD_ATTEMPTS,
                "Could not record outcome, item left active for recovery"
            );
        }

        if !coordinator.release_lock(&work_id).await {
            error!(work_id = %work_id, "Work lock was lost while processing");
        }
        debug!(work_id = %work_id, status = %item.status, duration_ms = duration.as_millis() as u64, "Work item finished");
    }

    /// Runs the processor under the processing timeout, pushing the lock
    /// expiry forward every third of the lock TTL.
    async fn process_with_renewal(&self, item: &WorkItem) -> Result<anyhow::Result<()>, Elapsed> {
        let locks = self.coordinator.locks();
        let lock_ttl = self.coordinator.config().lock_ttl;
        let every = (lock_ttl / 3).max(Duration::from_millis(100));

        let work = self.processor.process(item);
        tokio::pin!(work);

        let renewing = async {
            let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = &mut work => return result,
                    _ = renew.tick() => {
                        if !locks.extend(&item.work_id, lock_ttl).await {
                            warn!(work_id = %item.work_id, "Failed to renew work lock");
                        }
                    }
                }
            }
        };

        tokio::time::timeout(self.process_timeout, renewing).await
    }

    /// Stores the outcome, retrying after a poll interval when the store
    /// rejects it. A rejected attempt leaves `item` and its active entry
    /// untouched, so retrying is safe.
    async fn record_outcome(&self, item: &mut WorkItem, failure: Option<&str>) -> bool {
        let poll_interval = self.coordinator.config().poll_interval;
        for attempt in 1..=RECORD_ATTEMPTS {
            let recorded = match failure {
                None => self.coordinator.complete(item).await,
                Some(message) => self.coordinator.fail(item, message).await,
            };
            if recorded {
                return true;
            }
            if attempt < RECORD_ATTEMPTS {
                tokio::time::sleep(poll_interval).await;
            }
        }
        false
    }
}
