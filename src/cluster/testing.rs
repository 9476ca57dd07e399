//! Store double that injects backend errors into chosen operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::memory_store::MemoryStore;
use super::store::{CoordinationStore, ListPush, StoreError};

#[derive(Debug, Clone)]
struct Fault {
    op: &'static str,
    key_fragment: Option<String>,
    /// `None` fails forever.
    remaining: Option<usize>,
}

/// `MemoryStore` wrapper whose operations fail on demand.
///
/// Clones share both the data and the fault list.
#[derive(Clone, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl FaultyStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// Fails every call of `op`.
    pub(crate) fn fail(&self, op: &'static str) {
        self.add(Fault {
            op,
            key_fragment: None,
            remaining: None,
        });
    }

    /// Fails the next `times` calls of `op`.
    pub(crate) fn fail_times(&self, op: &'static str, times: usize) {
        self.add(Fault {
            op,
            key_fragment: None,
            remaining: Some(times),
        });
    }

    /// Fails calls of `op` whose key contains `fragment`.
    pub(crate) fn fail_on_key(&self, op: &'static str, fragment: &str) {
        self.add(Fault {
            op,
            key_fragment: Some(fragment.to_string()),
            remaining: None,
        });
    }

    /// Clears every fault.
    pub(crate) fn heal(&self) {
        self.faults_mut().clear();
    }

    fn add(&self, fault: Fault) {
        self.faults_mut().push(fault);
    }

    fn faults_mut(&self) -> std::sync::MutexGuard<'_, Vec<Fault>> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: &'static str, key: &str) -> Result<(), StoreError> {
        let mut faults = self.faults_mut();
        for fault in faults.iter_mut() {
            let key_matches = fault
                .key_fragment
                .as_deref()
                .map_or(true, |fragment| key.contains(fragment));
            if fault.op != op || !key_matches {
                continue;
            }
            match fault.remaining.as_mut() {
                Some(0) => continue,
                Some(left) => *left -= 1,
                None => {}
            }
            return Err(StoreError::ConnectionFailed(format!(
                "injected {} failure on '{}'",
                op, key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check("set_if_absent", key)?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check("delete_if_equals", key)?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check("expire_if_equals", key)?;
        self.inner.expire_if_equals(key, expected, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check("push", key)?;
        self.inner.push(key, value).await
    }

    async fn push_right(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check("push_right", key)?;
        self.inner.push_right(key, value).await
    }

    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError> {
        for push in pushes {
            self.check("push_batch", &push.key)?;
        }
        self.inner.push_batch(pushes).await
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("pop", key)?;
        self.inner.pop(key).await
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check("list_all", key)?;
        self.inner.list_all(key).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check("list_len", key)?;
        self.inner.list_len(key).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check("hash_set", key)?;
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check("hash_get", key)?;
        self.inner.hash_get(key, field).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check("hash_delete", key)?;
        self.inner.hash_delete(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check("hash_get_all", key)?;
        self.inner.hash_get_all(key).await
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check("hash_len", key)?;
        self.inner.hash_len(key).await
    }

    async fn hash_replace_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check("hash_replace_with_ttl", key)?;
        self.inner.hash_replace_with_ttl(key, fields, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check("expire", key)?;
        self.inner.expire(key, ttl).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check("sorted_add", key)?;
        self.inner.sorted_add(key, member, score).await
    }

    async fn sorted_pop_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.check("sorted_pop_until", key)?;
        self.inner.sorted_pop_until(key, max_score).await
    }

    async fn sorted_range_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.check("sorted_range_until", key)?;
        self.inner.sorted_range_until(key, max_score).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check("sorted_remove", key)?;
        self.inner.sorted_remove(key, member).await
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        self.check("sorted_len", key)?;
        self.inner.sorted_len(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check("keys_with_prefix", prefix)?;
        self.inner.keys_with_prefix(prefix).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.check("delete", key)?;
        }
        self.inner.delete(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check("exists", key)?;
        self.inner.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let store = FaultyStore::new(MemoryStore::new());
        store.fail_times("push", 1);

        assert!(store.push("q", "a").await.is_err());
        assert!(store.push("q", "b").await.is_ok());
        assert_eq!(store.list_len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_key_is_selective() {
        let store = FaultyStore::new(MemoryStore::new());
        store.fail_on_key("hash_set", "completed");

        assert!(store.hash_set("scraper:completed_work:n1", "f", "v").await.is_err());
        assert!(store.hash_set("scraper:active_work:n1", "f", "v").await.is_ok());

        store.heal();
        assert!(store.hash_set("scraper:completed_work:n1", "f", "v").await.is_ok());
    }
}
