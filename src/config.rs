//! Cluster coordination configuration.
//!
//! This module provides the settings of one coordinating node: where the
//! store lives, how keys are namespaced, heartbeat and lock timings,
//! failure-detection thresholds, retry backoff and driver loop pacing.

use std::time::Duration;
use thiserror::Error;

use crate::cluster::health::{DEFAULT_HEALTH_FRESHNESS, DEFAULT_HEARTBEAT_INTERVAL};
use crate::cluster::keys::DEFAULT_PREFIX;
use crate::cluster::lifecycle::{LifecyclePolicy, DEFAULT_COMPLETED_RETENTION};
use crate::cluster::lock::DEFAULT_LOCK_TTL;
use crate::cluster::recovery::{
    RecoveryPolicy, DEFAULT_RECOVERY_LOCK_TTL, DEFAULT_STALE_NODE_THRESHOLD,
};
use crate::cluster::work_item::{BACKOFF_BASE, BACKOFF_CAP};

/// Default store location.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration of one coordinating node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix prepended to every key.
    pub key_prefix: String,
    /// Identity of this node; generated when absent.
    pub node_id: Option<String>,

    // Health settings
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Heartbeat age beyond which a node receives no new work.
    pub health_freshness: Duration,

    // Work settings
    /// Time to live of work item locks.
    pub lock_ttl: Duration,
    /// Retention of completed work history.
    pub completed_retention: Duration,
    /// Retry delay after the first failure is twice this value.
    pub backoff_base: Duration,
    /// Upper bound of the retry delay.
    pub backoff_cap: Duration,

    // Recovery settings
    /// Heartbeat age beyond which a node is considered dead.
    pub stale_node_threshold: Duration,
    /// How often the driver loop runs failure detection.
    pub cleanup_interval: Duration,
    /// Serialize recovery of each dead node across detectors.
    pub exclusive_recovery: bool,
    /// Time to live of the per-node recovery lock.
    pub recovery_lock_ttl: Duration,

    // Driver settings
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Bounded wait for background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            node_id: None,

            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            health_freshness: DEFAULT_HEALTH_FRESHNESS,

            lock_ttl: DEFAULT_LOCK_TTL,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,

            stale_node_threshold: DEFAULT_STALE_NODE_THRESHOLD,
            cleanup_interval: Duration::from_secs(60),
            exclusive_recovery: true,
            recovery_lock_ttl: DEFAULT_RECOVERY_LOCK_TTL,

            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(35),
        }
    }
}

impl ClusterConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `CLUSTER_KEY_PREFIX`: Key prefix (default: scraper:)
    /// - `CLUSTER_NODE_ID`: Node identity (default: generated)
    /// - `CLUSTER_HEARTBEAT_INTERVAL_SECS`: Heartbeat interval (default: 30)
    /// - `CLUSTER_HEALTH_FRESHNESS_SECS`: Freshness window (default: 120)
    /// - `CLUSTER_LOCK_TTL_SECS`: Work lock TTL (default: 300)
    /// - `CLUSTER_COMPLETED_RETENTION_SECS`: Completed history TTL (default: 86400)
    /// - `CLUSTER_BACKOFF_BASE_SECS`: Backoff base (default: 30)
    /// - `CLUSTER_BACKOFF_CAP_SECS`: Backoff cap (default: 300)
    /// - `CLUSTER_STALE_NODE_SECS`: Dead node threshold (default: 300)
    /// - `CLUSTER_CLEANUP_INTERVAL_SECS`: Failure detection interval (default: 60)
    /// - `CLUSTER_EXCLUSIVE_RECOVERY`: Lock each dead node's recovery (default: true)
    /// - `CLUSTER_RECOVERY_LOCK_TTL_SECS`: Recovery lock TTL (default: 60)
    /// - `CLUSTER_POLL_INTERVAL_MS`: Empty queue poll interval (default: 1000)
    /// - `CLUSTER_SHUTDOWN_TIMEOUT_SECS`: Shutdown wait (default: 35)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|val| parse_env_value::<u64>(&val, key).map(Duration::from_secs))
                .transpose()
        };

        // Store settings
        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("CLUSTER_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Some(val) = lookup("CLUSTER_NODE_ID") {
            if !val.trim().is_empty() {
                config.node_id = Some(val.trim().to_string());
            }
        }

        // Health settings
        if let Some(val) = secs("CLUSTER_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = val;
        }

        if let Some(val) = secs("CLUSTER_HEALTH_FRESHNESS_SECS")? {
            config.health_freshness = val;
        }

        // Work settings
        if let Some(val) = secs("CLUSTER_LOCK_TTL_SECS")? {
            config.lock_ttl = val;
        }

        if let Some(val) = secs("CLUSTER_COMPLETED_RETENTION_SECS")? {
            config.completed_retention = val;
        }

        if let Some(val) = secs("CLUSTER_BACKOFF_BASE_SECS")? {
            config.backoff_base = val;
        }

        if let Some(val) = secs("CLUSTER_BACKOFF_CAP_SECS")? {
            config.backoff_cap = val;
        }

        // Recovery settings
        if let Some(val) = secs("CLUSTER_STALE_NODE_SECS")? {
            config.stale_node_threshold = val;
        }

        if let Some(val) = secs("CLUSTER_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = val;
        }

        if let Some(val) = lookup("CLUSTER_EXCLUSIVE_RECOVERY") {
            config.exclusive_recovery = parse_env_bool(&val, "CLUSTER_EXCLUSIVE_RECOVERY")?;
        }

        if let Some(val) = secs("CLUSTER_RECOVERY_LOCK_TTL_SECS")? {
            config.recovery_lock_ttl = val;
        }

        // Driver settings
        if let Some(val) = lookup("CLUSTER_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "CLUSTER_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Some(val) = secs("CLUSTER_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if matches!(&self.node_id, Some(id) if id.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "node_id cannot be empty".to_string(),
            ));
        }

        if self.heartbeat_interval.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be at least one second".to_string(),
            ));
        }

        if self.health_freshness < self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "health_freshness must not be shorter than heartbeat_interval".to_string(),
            ));
        }

        if self.stale_node_threshold < self.health_freshness {
            return Err(ConfigError::ValidationFailed(
                "stale_node_threshold must not be shorter than health_freshness".to_string(),
            ));
        }

        if self.lock_ttl.as_secs() == 0 || self.recovery_lock_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock TTLs must be at least one second".to_string(),
            ));
        }

        if self.completed_retention.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "completed_retention must be at least one second".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::ValidationFailed(
                "backoff_base cannot exceed backoff_cap".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cleanup_interval and poll_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retention and backoff settings for the lifecycle manager.
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            completed_retention: self.completed_retention,
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
        }
    }

    /// Thresholds for the failure detector.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            stale_threshold: self.stale_node_threshold,
            exclusive: self.exclusive_recovery,
            lock_ttl: self.recovery_lock_ttl,
        }
    }

    // Builder methods

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_stale_node_threshold(mut self, threshold: Duration) -> Self {
        self.stale_node_threshold = threshold;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_exclusive_recovery(mut self, enabled: bool) -> Self {
        self.exclusive_recovery = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
