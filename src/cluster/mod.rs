//! Cluster coordination over a shared Redis store.
//!
//! This module lets a fleet of scraper nodes share one stream of work items
//! without any node owning the full job list:
//!
//! - **LockManager**: per-item mutual exclusion with `SET NX EX` and atomic compare-and-delete
//! - **WorkDistributor**: load-aware round robin over healthy nodes
//! - **WorkLifecycle**: pull, complete, fail and exponential-backoff retries
//! - **HealthMonitor**: background heartbeat with resource classification
//! - **FailureDetector**: finds dead nodes and migrates their work
//! - **StatusAggregator**: cluster-wide snapshot for operators
//! - **Coordinator**: owns all of the above for one node, plus graceful shutdown
//! - **NodeRunner**: optional driver loop around a caller-supplied `WorkProcessor`
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  distribute  │
//!                      │  (CLI/API)   │
//!                      └──────┬───────┘
//!                             │ round robin by workload
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!  work_queue:{a}      work_queue:{b}      work_queue:{c}      work_queue (pool)
//!         │                   │                   │
//!    ┌────▼────┐         ┌────▼────┐         ┌────▼────┐
//!    │ Node a  │         │ Node b  │         │ Node c  │ ── heartbeat ──► node_health:{id}
//!    └────┬────┘         └────┬────┘         └────┬────┘                  node_registry
//!         ▼                   ▼                   ▼
//!  active_work → completed_work / failed_work / retry_queue
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use scrape_cluster::cluster::{Coordinator, WorkItem};
//! use scrape_cluster::config::ClusterConfig;
//!
//! let coordinator = Coordinator::connect(ClusterConfig::from_env()?).await?;
//! coordinator.start_health_monitor();
//!
//! coordinator
//!     .distribute(vec![WorkItem::generated("Berlin", "https://example.com/berlin")])
//!     .await;
//!
//! for mut item in coordinator.pull(1).await {
//!     if coordinator.acquire_lock(&item.work_id).await {
//!         coordinator.complete(&mut item).await;
//!         coordinator.release_lock(&item.work_id).await;
//!     }
//! }
//!
//! coordinator.coordinate_shutdown().await;
//! ```
//!
//! # Reliability
//!
//! - **Crash recovery**: pulled items are recorded in the node's active hash
//!   before processing, so a dead node's work is always found again
//! - **No lost work**: items that cannot be placed are parked on the global pool
//! - **Bounded retries**: failures back off exponentially up to a cap, then
//!   land in the node's failed hash

pub mod coordinator;
pub mod distribution;
pub mod health;
pub mod keys;
pub mod lifecycle;
pub mod lock;
pub mod memory_store;
pub mod node;
pub mod recovery;
pub mod redis_store;
pub mod status;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod work_item;

// Re-export main types for convenience
pub use coordinator::{generate_node_id, Coordinator, ShutdownReport};
pub use distribution::{DistributionResult, WorkDistributor};
pub use health::{
    HealthMonitor, HealthState, HealthStatus, NodeDirectory, ResourceProbe, ResourceUsage,
    StaticProbe, SystemProbe,
};
pub use keys::KeySpace;
pub use lifecycle::{LifecyclePolicy, WorkLifecycle};
pub use lock::LockManager;
pub use memory_store::MemoryStore;
pub use node::{NodeRunner, RunnerStats, WorkProcessor};
pub use recovery::{FailureDetector, RecoveryPolicy, RecoveryReport};
pub use redis_store::RedisStore;
pub use status::{ClusterStatus, NodeSummary, QueueSizes, StatusAggregator};
pub use store::{CoordinationStore, StoreError};
pub use work_item::{RetryRecord, WorkItem, WorkStatus};
