//! Distributed mutual exclusion over work items.
//!
//! A lock is a single string key `lock:{work_id}` holding the owner's node id
//! with an expiry. Acquisition is one `SET NX EX`; release and renewal are
//! atomic compare-then-mutate scripts, so a node whose lock expired and was
//! taken over can never delete or extend the new owner's lock.
//!
//! Backend errors are logged and reported as "not acquired" / "not
//! released": callers treat them as "try later".

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::keys::KeySpace;
use super::store::CoordinationStore;

/// Default lock time to live.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Acquires and releases per-work-item locks on behalf of one node.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    node_id: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, node_id: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            node_id: node_id.into(),
        }
    }

    /// Tries to take the lock once. Returns true iff it was free.
    pub async fn acquire(&self, work_id: &str, ttl: Duration) -> bool {
        let key = self.keys.lock(work_id);
        match self.store.set_if_absent(&key, &self.node_id, ttl).await {
            Ok(acquired) => {
                debug!(node_id = %self.node_id, work_id, acquired, "Lock acquire attempt");
                acquired
            }
            Err(e) => {
                warn!(node_id = %self.node_id, work_id, error = %e, "Failed to acquire lock");
                false
            }
        }
    }

    /// Releases the lock if this node owns it.
    ///
    /// Returns false, without touching the key, when another node holds it.
    pub async fn release(&self, work_id: &str) -> bool {
        let key = self.keys.lock(work_id);
        match self.store.delete_if_equals(&key, &self.node_id).await {
            Ok(released) => {
                if !released {
                    debug!(node_id = %self.node_id, work_id, "Lock not owned, release skipped");
                }
                released
            }
            Err(e) => {
                warn!(node_id = %self.node_id, work_id, error = %e, "Failed to release lock");
                false
            }
        }
    }

    /// Pushes the expiry of an owned lock forward.
    ///
    /// Returns false when the lock expired or changed hands.
    pub async fn extend(&self, work_id: &str, ttl: Duration) -> bool {
        let key = self.keys.lock(work_id);
        match self.store.expire_if_equals(&key, &self.node_id, ttl).await {
            Ok(extended) => extended,
            Err(e) => {
                warn!(node_id = %self.node_id, work_id, error = %e, "Failed to extend lock");
                false
            }
        }
    }

    /// Returns the node currently holding the lock.
    pub async fn holder(&self, work_id: &str) -> Option<String> {
        let key = self.keys.lock(work_id);
        match self.store.get(&key).await {
            Ok(holder) => holder,
            Err(e) => {
                warn!(work_id, error = %e, "Failed to read lock holder");
                None
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}
