//! Coordination store abstraction.
//!
//! The coordinator only needs a small set of atomic primitives from the
//! shared key-value backend:
//!
//! - conditional set with expiry and atomic compare-and-delete (locks)
//! - list push/pop, plus a right push to return a popped value (work queues)
//! - hash set/get/delete (active, completed and failed work, node health)
//! - sorted-set insert and atomic pop-by-score (retry queue, node registry)
//! - key expiry and enumeration by prefix
//!
//! `RedisStore` implements them against Redis; `MemoryStore` keeps everything
//! in process for tests and single-node runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backend.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or parse a stored record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key holds a value of another type.
    #[error("Wrong type for key '{0}'")]
    WrongType(String),
}

/// One LPUSH of a batched push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPush {
    pub key: String,
    pub value: String,
}

impl ListPush {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Atomic primitives of the shared coordination store.
///
/// Lists are pushed on the left and popped on the right, giving FIFO order.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Sets `key` to `value` with `ttl` only if the key does not exist.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently holds `expected`, atomically.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Resets the expiry of `key` only if it currently holds `expected`, atomically.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Reads a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Pushes one value onto the left of a list.
    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pushes one value onto the right of a list, so the next `pop` returns it.
    async fn push_right(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pushes many values in a single round trip. Either every push is
    /// applied or none is.
    async fn push_batch(&self, pushes: &[ListPush]) -> Result<(), StoreError>;

    /// Pops one value from the right of a list.
    async fn pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns the whole list, left to right.
    async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the length of a list (0 if missing).
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Sets one hash field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Reads one hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Deletes one hash field, returning whether it existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Returns every field of a hash.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Returns the number of fields of a hash (0 if missing).
    async fn hash_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Replaces a hash with `fields` and sets its expiry in one round trip.
    async fn hash_replace_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Sets the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Adds or updates a sorted-set member.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Atomically reads and removes every member with score `<= max_score`.
    async fn sorted_pop_until(&self, key: &str, max_score: f64)
        -> Result<Vec<String>, StoreError>;

    /// Returns members with score `<= max_score`, lowest first, without removing them.
    async fn sorted_range_until(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Removes one sorted-set member.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Returns the number of sorted-set members (0 if missing).
    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Lists keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes keys; missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Returns whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
