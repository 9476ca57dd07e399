//! Key schema of the coordination store.
//!
//! Every key lives under a common prefix (`scraper:` by default):
//!
//! | Key | Type | Purpose |
//! |---|---|---|
//! | `work_queue:{node_id}` | list | per-node pending work |
//! | `work_queue` | list | unassigned pool |
//! | `active_work:{node_id}` | hash | in-flight work |
//! | `completed_work:{node_id}` | hash | history, expires after 24h |
//! | `failed_work:{node_id}` | hash | terminal failures |
//! | `retry_queue` | sorted set | scheduled retries, scored by retry time |
//! | `node_health:{node_id}` | hash | liveness, expires after 3 heartbeats |
//! | `node_registry` | sorted set | last heartbeat per node |
//! | `lock:{work_id}` | string | mutual exclusion |

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "scraper:";

/// Builds namespaced keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn node_queue(&self, node_id: &str) -> String {
        format!("{}work_queue:{}", self.prefix, node_id)
    }

    pub fn global_queue(&self) -> String {
        format!("{}work_queue", self.prefix)
    }

    pub fn active(&self, node_id: &str) -> String {
        format!("{}active_work:{}", self.prefix, node_id)
    }

    pub fn completed(&self, node_id: &str) -> String {
        format!("{}completed_work:{}", self.prefix, node_id)
    }

    pub fn failed(&self, node_id: &str) -> String {
        format!("{}failed_work:{}", self.prefix, node_id)
    }

    pub fn retry_queue(&self) -> String {
        format!("{}retry_queue", self.prefix)
    }

    pub fn node_health(&self, node_id: &str) -> String {
        format!("{}node_health:{}", self.prefix, node_id)
    }

    /// Prefix shared by all node health keys.
    pub fn node_health_prefix(&self) -> String {
        format!("{}node_health:", self.prefix)
    }

    pub fn node_registry(&self) -> String {
        format!("{}node_registry", self.prefix)
    }

    pub fn lock(&self, work_id: &str) -> String {
        format!("{}lock:{}", self.prefix, work_id)
    }

    /// Lock guarding the migration of a dead node's work.
    pub fn recovery_lock_name(node_id: &str) -> String {
        format!("recovery:{}", node_id)
    }
}
