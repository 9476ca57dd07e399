//! In-process implementation of the coordination store.
//!
//! Mirrors the Redis semantics the coordinator relies on (NX sets, key
//! expiry, left-push/right-pop lists, hashes, score-ordered sets) behind a
//! single mutex, so every operation is trivially atomic. Used by the test
//! suite and for single-node runs without Redis.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::store::{CoordinationStore, ListPush, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Sorted(BTreeMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>, StoreError> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => Ok(list),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, StoreError> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => Ok(hash),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, f64>, StoreError> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Sorted(BTreeMap::new())));
        }
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Sorted(set)) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Redis deletes aggregate keys once they become empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::Sorted(set)) => set.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

/// In-memory coordination store.
///
/// Cloning shares the underlying data, so several coordinators built from
/// clones of one store behave like nodes sharing one Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        // A poisoned lock only means a panic elsewhere; the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut space = self.lock();
        let expires_at = space.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let mut space = self.lock();
        space.purge_expired();
        space.entries.len()
    }
}

fn sorted_by_score(set: &BTreeMap<String, f64>, max_score: f64) -> Vec<(String, f64)> {
    let mut due: Vec<(String, f64)> = set
        .iter()
        .filter(|(_, score)| **score <= max_score)
        .map(|(member, score)| (member.clone(), *score))
        .collect();
    due.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    due
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_some() {
            return Ok(false);
        }
        space.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut space = self.lock();
        let matches = matches!(
            space.live(key).map(|e| &e.value),
            Some(Value::Str(current)) if current == expected
        );
        if matches {
            space.entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut space = self.lock();
        match space.live(key) {
            Some(entry) if matches!(&entry.value, Value::Str(current) if current == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut space = self.lock();
        match space.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut space = self.lock();
        space.list_mut(key)?.push_front(value.to_string());
        Ok(())
    }

    async fn push_right(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut space = self.lock();
        space.list_mut(key)?.push_back(value.to_string());
        Ok(())
    }

    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError> {
        let mut space = self.lock();
        // Type-check every target first so a bad key applies nothing.
        for push in pushes {
            let wrong_type = matches!(
                space.live(&push.key).map(|e| &e.value),
                Some(value) if !matches!(value, Value::List(_))
            );
            if wrong_type {
                return Err(StoreError::WrongType(push.key.clone()));
            }
        }
        for push in pushes {
            space.list_mut(&push.key)?.push_front(push.value.clone());
        }
        Ok(())
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(None);
        }
        let value = space.list_mut(key)?.pop_back();
        space.drop_if_empty(key);
        Ok(value)
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(Vec::new());
        }
        Ok(space.list_mut(key)?.iter().cloned().collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(0);
        }
        Ok(space.list_mut(key)?.len())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut space = self.lock();
        space
            .hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(None);
        }
        Ok(space.hash_mut(key)?.get(field).cloned())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(false);
        }
        let removed = space.hash_mut(key)?.remove(field).is_some();
        space.drop_if_empty(key);
        Ok(removed)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(HashMap::new());
        }
        Ok(space.hash_mut(key)?.clone())
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(0);
        }
        Ok(space.hash_mut(key)?.len())
    }

    async fn hash_replace_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut space = self.lock();
        space.entries.remove(key);
        if fields.is_empty() {
            return Ok(());
        }
        space.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(fields.iter().cloned().collect()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut space = self.lock();
        if let Some(entry) = space.live(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut space = self.lock();
        space.sorted_mut(key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_pop_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(Vec::new());
        }
        let set = space.sorted_mut(key)?;
        let due = sorted_by_score(set, max_score);
        for (member, _) in &due {
            set.remove(member);
        }
        space.drop_if_empty(key);
        Ok(due.into_iter().map(|(member, _)| member).collect())
    }

    async fn sorted_range_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(Vec::new());
        }
        Ok(sorted_by_score(space.sorted_mut(key)?, max_score))
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(());
        }
        space.sorted_mut(key)?.remove(member);
        space.drop_if_empty(key);
        Ok(())
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut space = self.lock();
        if space.live(key).is_none() {
            return Ok(0);
        }
        Ok(space.sorted_mut(key)?.len())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut space = self.lock();
        space.purge_expired();
        let mut keys: Vec<String> = space
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut space = self.lock();
        for key in keys {
            space.entries.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut space = self.lock();
        Ok(space.live(key).is_some())
    }
}
