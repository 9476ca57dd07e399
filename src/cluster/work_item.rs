//! Work item definitions for the cluster coordinator.
//!
//! This module defines the record that travels through the coordination store:
//!
//! - `WorkItem`: one schedulable unit of scraping work with retry state
//! - `WorkStatus`: lifecycle state of a work item
//! - `RetryRecord`: entry of the time-ordered retry set
//! - `FailureOutcome`: what a recorded failure means for scheduling

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of retries for a work item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default priority for work items.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Base delay of the exponential retry backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Upper bound of the retry backoff.
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Lifecycle state of a work item.
///
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting in a queue.
    Pending,
    /// Pulled by a node and being processed.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting all retries.
    Failed,
    /// Failed recoverably, waiting in the retry set.
    Retrying,
}

impl WorkStatus {
    /// Returns whether no further transition is allowed from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending => write!(f, "PENDING"),
            WorkStatus::InProgress => write!(f, "IN_PROGRESS"),
            WorkStatus::Completed => write!(f, "COMPLETED"),
            WorkStatus::Failed => write!(f, "FAILED"),
            WorkStatus::Retrying => write!(f, "RETRYING"),
        }
    }
}

/// A unit of scraping work.
///
/// Work items live in the coordination store; a node only holds a copy while
/// it processes one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier, used as lock key and hash field.
    pub work_id: String,
    /// City the listing search targets.
    pub city: String,
    /// URL to scrape.
    pub url: String,
    /// Carried for callers; distribution does not reorder by it.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Maximum number of retries before the item is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Number of failures recorded so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Current lifecycle state.
    pub status: WorkStatus,
    /// Node whose queue currently holds the item.
    #[serde(default)]
    pub assigned_node: Option<String>,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// When the item was last pulled.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the item completed.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// What a recorded failure means for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The item should be retried after `delay`.
    Retry { delay: Duration },
    /// Retries are exhausted; the item is terminally failed.
    Exhausted,
    /// The item was already terminal and was left untouched.
    Ignored,
}

impl WorkItem {
    /// Creates a pending work item with default priority and retry budget.
    pub fn new(
        work_id: impl Into<String>,
        city: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            work_id: work_id.into(),
            city: city.into(),
            url: url.into(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            status: WorkStatus::Pending,
            assigned_node: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Creates a pending work item with a generated id.
    pub fn generated(city: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), city, url)
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns whether the item reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Assigns the item to a node queue.
    pub fn assign(&mut self, node_id: &str) {
        self.assigned_node = Some(node_id.to_string());
        self.status = WorkStatus::Pending;
    }

    /// Marks the item as pulled by its node.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = WorkStatus::InProgress;
        self.started_at = Some(now);
    }

    /// Marks the item completed. Returns false if it was already terminal.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = WorkStatus::Completed;
        self.completed_at = Some(now);
        true
    }

    /// Records a failure and decides whether the item gets another attempt.
    pub fn record_failure(&mut self, message: impl Into<String>) -> FailureOutcome {
        self.record_failure_with(message, BACKOFF_BASE, BACKOFF_CAP)
    }

    /// Like `record_failure`, with an explicit backoff base and cap.
    pub fn record_failure_with(
        &mut self,
        message: impl Into<String>,
        base: Duration,
        cap: Duration,
    ) -> FailureOutcome {
        if self.is_terminal() {
            return FailureOutcome::Ignored;
        }

        self.error_message = Some(message.into());
        self.retry_count += 1;

        if self.retry_count < self.max_retries {
            self.status = WorkStatus::Retrying;
            FailureOutcome::Retry {
                delay: backoff_delay(self.retry_count, base, cap),
            }
        } else {
            self.status = WorkStatus::Failed;
            FailureOutcome::Exhausted
        }
    }

    /// Puts the item back into circulation after its node went away.
    ///
    /// Does not consume a retry.
    pub fn reset_for_redistribution(&mut self) {
        self.status = WorkStatus::Pending;
        self.assigned_node = None;
        self.started_at = None;
    }

    /// Returns how long ago the item was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Backoff before the next attempt after `retry_count` failures.
///
/// `min(cap, base * 2^retry_count)`.
pub fn retry_delay(retry_count: u32) -> Duration {
    backoff_delay(retry_count, BACKOFF_BASE, BACKOFF_CAP)
}

/// Exponential backoff with a configurable base and cap.
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Entry of the retry sorted set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    /// The item to retry.
    pub item: WorkItem,
    /// Earliest time the item may run again.
    pub retry_time: DateTime<Utc>,
}

impl RetryRecord {
    /// Score of the record in the retry set (unix seconds).
    pub fn score(&self) -> f64 {
        timestamp_score(self.retry_time)
    }
}

/// Converts a timestamp into a sorted-set score.
pub fn timestamp_score(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}
