//! Node health reporting and the healthy-node view.
//!
//! Every node runs a `HealthMonitor` background task that samples local
//! resource usage, classifies it and publishes a `HealthStatus` hash under
//! `node_health:{node_id}` with an expiry of three heartbeat intervals. A node
//! that stops heartbeating therefore drops out of the healthy set on its own;
//! `NodeDirectory` adds a freshness check on top of key expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::keys::KeySpace;
use super::store::CoordinationStore;
use super::work_item::timestamp_score;
use crate::metrics::MetricsCollector;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A heartbeat older than this makes a node ineligible for new work.
pub const DEFAULT_HEALTH_FRESHNESS: Duration = Duration::from_secs(120);

/// Self-reported condition of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthState {
    /// Returns whether a node in this state may receive new work.
    pub fn accepts_work(self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Unhealthy => "UNHEALTHY",
            HealthState::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthState {
    type Err = HealthRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HEALTHY" => Ok(HealthState::Healthy),
            "DEGRADED" => Ok(HealthState::Degraded),
            "UNHEALTHY" => Ok(HealthState::Unhealthy),
            "OFFLINE" => Ok(HealthState::Offline),
            other => Err(HealthRecordError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Errors raised while decoding a stored health record.
#[derive(Debug, Error)]
pub enum HealthRecordError {
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Local resource usage in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Classifies resource usage.
///
/// Unhealthy when any metric exceeds 90%, degraded when CPU or memory exceed
/// 70% or disk exceeds 80%.
pub fn classify(usage: &ResourceUsage) -> HealthState {
    let ResourceUsage {
        cpu_percent: cpu,
        memory_percent: memory,
        disk_percent: disk,
    } = *usage;

    if cpu > 90.0 || memory > 90.0 || disk > 90.0 {
        HealthState::Unhealthy
    } else if cpu > 70.0 || memory > 70.0 || disk > 80.0 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Health record published by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub node_id: String,
    pub status: HealthState,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_workers: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u64,
    pub warning_count: u64,
}

impl HealthStatus {
    /// Flattens the record into hash fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("node_id".to_string(), self.node_id.clone()),
            ("status".to_string(), self.status.to_string()),
            ("cpu_percent".to_string(), self.cpu_percent.to_string()),
            ("memory_percent".to_string(), self.memory_percent.to_string()),
            ("disk_percent".to_string(), self.disk_percent.to_string()),
            ("active_workers".to_string(), self.active_workers.to_string()),
            ("last_heartbeat".to_string(), self.last_heartbeat.to_rfc3339()),
            ("error_count".to_string(), self.error_count.to_string()),
            ("warning_count".to_string(), self.warning_count.to_string()),
        ]
    }

    /// Rebuilds a record from hash fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, HealthRecordError> {
        let node_id = required(fields, "node_id")?.to_string();
        let status = required(fields, "status")?.parse()?;
        let last_heartbeat = DateTime::parse_from_rfc3339(required(fields, "last_heartbeat")?)
            .map_err(|_| HealthRecordError::InvalidValue {
                field: "last_heartbeat",
                value: fields["last_heartbeat"].clone(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            node_id,
            status,
            cpu_percent: parse_field(fields, "cpu_percent")?,
            memory_percent: parse_field(fields, "memory_percent")?,
            disk_percent: parse_field(fields, "disk_percent")?,
            active_workers: parse_field(fields, "active_workers")?,
            last_heartbeat,
            error_count: parse_field(fields, "error_count")?,
            warning_count: parse_field(fields, "warning_count")?,
        })
    }

    /// Time elapsed since the heartbeat, as seen at `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, HealthRecordError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(HealthRecordError::MissingField(name))
}

/// Numeric fields default to zero when absent.
fn parse_field<T: std::str::FromStr + Default>(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<T, HealthRecordError> {
    match fields.get(name) {
        None => Ok(T::default()),
        Some(raw) => raw.parse().map_err(|_| HealthRecordError::InvalidValue {
            field: name,
            value: raw.clone(),
        }),
    }
}

/// Source of local resource usage.
pub trait ResourceProbe: Send + Sync {
    /// Samples current usage. Metrics that cannot be read are reported as 0.
    fn sample(&self) -> ResourceUsage;
}

/// Probe backed by `sysinfo`.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let (cpu_percent, memory_percent) = match self.system.lock() {
            Ok(mut system) => {
                // CPU usage is computed between two refreshes, so the first
                // sample after startup reads 0.
                system.refresh_cpu();
                system.refresh_memory();
                let cpu = f64::from(system.global_cpu_info().cpu_usage());
                let cpu = if cpu.is_finite() { cpu.clamp(0.0, 100.0) } else { 0.0 };
                (cpu, percent(system.used_memory(), system.total_memory()))
            }
            Err(_) => (0.0, 0.0),
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next())
            .map(|disk| {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            })
            .unwrap_or(0.0);

        ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }
}

/// Probe returning fixed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ResourceUsage);

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

/// Process-local error and warning counters published with each heartbeat.
#[derive(Debug, Default)]
pub struct HealthCounters {
    errors: AtomicU64,
    warnings: AtomicU64,
}

impl HealthCounters {
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }
}

/// Read side of node health: which nodes exist and which may take work.
#[derive(Clone)]
pub struct NodeDirectory {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    freshness: Duration,
}

impl NodeDirectory {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, freshness: Duration) -> Self {
        Self {
            store,
            keys,
            freshness,
        }
    }

    /// Reads every parseable node health record, sorted by node id.
    ///
    /// Unreadable or corrupt records are logged and skipped.
    pub async fn node_records(&self) -> Vec<HealthStatus> {
        let health_keys = match self
            .store
            .keys_with_prefix(&self.keys.node_health_prefix())
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list node health keys");
                return Vec::new();
            }
        };

        let reads = health_keys.iter().map(|key| async move {
            (key, self.store.hash_get_all(key).await)
        });

        let mut records = Vec::with_capacity(health_keys.len());
        for (key, result) in futures::future::join_all(reads).await {
            match result {
                // Expired between listing and reading.
                Ok(fields) if fields.is_empty() => {}
                Ok(fields) => match HealthStatus::from_fields(&fields) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(key = %key, error = %e, "Skipping corrupt health record"),
                },
                Err(e) => warn!(key = %key, error = %e, "Failed to read health record"),
            }
        }

        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Ids of nodes eligible for new work, sorted.
    pub async fn healthy_nodes(&self) -> Vec<String> {
        self.healthy_nodes_at(Utc::now()).await
    }

    /// Ids of nodes that report `HEALTHY` or `DEGRADED` with a heartbeat
    /// within the freshness window at `now`.
    pub async fn healthy_nodes_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.node_records()
            .await
            .into_iter()
            .filter(|record| {
                record.status.accepts_work() && record.heartbeat_age(now) <= self.freshness
            })
            .map(|record| record.node_id)
            .collect()
    }
}

/// Shared state of the monitor task.
struct MonitorState {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    node_id: String,
    interval: Duration,
    probe: Arc<dyn ResourceProbe>,
    counters: Arc<HealthCounters>,
    metrics: MetricsCollector,
    /// Publish `OFFLINE` so the node stays visible without receiving work.
    standby: AtomicBool,
}

impl MonitorState {
    fn record_ttl(&self) -> Duration {
        self.interval * 3
    }

    async fn build_status(&self, state_override: Option<HealthState>) -> HealthStatus {
        // sysinfo refreshes block, disk enumeration especially.
        let probe = Arc::clone(&self.probe);
        let usage = match tokio::task::spawn_blocking(move || probe.sample()).await {
            Ok(usage) => usage,
            Err(e) => {
                self.counters.record_warning();
                warn!(node_id = %self.node_id, error = %e, "Resource sampling failed");
                ResourceUsage::default()
            }
        };

        let active_workers = match self.store.hash_len(&self.keys.active(&self.node_id)).await {
            Ok(count) => count,
            Err(e) => {
                self.counters.record_warning();
                warn!(node_id = %self.node_id, error = %e, "Failed to count active work");
                0
            }
        };

        HealthStatus {
            node_id: self.node_id.clone(),
            status: state_override.unwrap_or_else(|| classify(&usage)),
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            disk_percent: usage.disk_percent,
            active_workers,
            last_heartbeat: Utc::now(),
            error_count: self.counters.errors(),
            warning_count: self.counters.warnings(),
        }
    }

    async fn publish(&self, status: &HealthStatus) -> bool {
        let key = self.keys.node_health(&self.node_id);
        if let Err(e) = self
            .store
            .hash_replace_with_ttl(&key, &status.to_fields(), self.record_ttl())
            .await
        {
            self.counters.record_warning();
            error!(node_id = %self.node_id, error = %e, "Failed to publish heartbeat");
            return false;
        }

        let seen = timestamp_score(status.last_heartbeat);
        if let Err(e) = self
            .store
            .sorted_add(&self.keys.node_registry(), &self.node_id, seen)
            .await
        {
            self.counters.record_warning();
            warn!(node_id = %self.node_id, error = %e, "Failed to update node registry");
        }

        self.metrics
            .record_heartbeat(status.status.as_str(), status.active_workers);
        true
    }

    async fn tick(&self) -> Option<HealthStatus> {
        let state_override = self
            .standby
            .load(Ordering::SeqCst)
            .then_some(HealthState::Offline);
        let status = self.build_status(state_override).await;
        debug!(
            node_id = %self.node_id,
            status = %status.status,
            cpu = status.cpu_percent,
            memory = status.memory_percent,
            disk = status.disk_percent,
            active = status.active_workers,
            "Heartbeat"
        );
        self.publish(&status).await.then_some(status)
    }
}

/// Heartbeat ticker. A tick that overruns delays the schedule instead of
/// firing the missed ticks back to back.
fn heartbeat_ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Background heartbeat publisher for one node.
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
    stop_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        node_id: impl Into<String>,
        interval: Duration,
        probe: Arc<dyn ResourceProbe>,
        counters: Arc<HealthCounters>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once per stop
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: Arc::new(MonitorState {
                store,
                keys,
                node_id: node_id.into(),
                interval,
                probe,
                counters,
                metrics: MetricsCollector::new(),
                standby: AtomicBool::new(false),
            }),
            shutdown_tx,
            handle: Mutex::new(None),
            is_running: AtomicBool::new(false),
            stop_timeout: interval + Duration::from_secs(5),
        }
    }

    /// Sets how long `stop` waits for the task to exit.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Starts the heartbeat task. Calling it on a running monitor does nothing.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!(node_id = %self.state.node_id, "Health monitor already running");
            return;
        }

        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!(node_id = %state.node_id, interval_secs = state.interval.as_secs(), "Health monitor started");
            let mut ticker = heartbeat_ticker(state.interval);

            loop {
                // A tick always runs to completion; the signal is only seen between ticks.
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        state.tick().await;
                    }
                }
            }

            info!(node_id = %state.node_id, "Health monitor stopped");
        });

        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
    }

    /// Stops the heartbeat task and waits for it to exit.
    ///
    /// Returns false if the task had to be aborted after the stop timeout.
    /// Calling it on a stopped monitor does nothing.
    pub async fn stop(&self) -> bool {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return true;
        }

        // Ignore send error - the task may have already stopped
        let _ = self.shutdown_tx.send(());

        let handle = self.handle.lock().ok().and_then(|mut slot| slot.take());
        let Some(handle) = handle else {
            return true;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(node_id = %self.state.node_id, error = %e, "Health monitor task panicked");
                false
            }
            Err(_) => {
                warn!(
                    node_id = %self.state.node_id,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "Health monitor did not stop in time, aborting"
                );
                abort.abort();
                false
            }
        }
    }

    /// In standby the node heartbeats as `OFFLINE`: it stays fresh for the
    /// failure detector but is never picked for new work.
    pub fn set_standby(&self, standby: bool) {
        self.state.standby.store(standby, Ordering::SeqCst);
    }

    pub fn is_standby(&self) -> bool {
        self.state.standby.load(Ordering::SeqCst)
    }

    /// Publishes one heartbeat immediately.
    pub async fn heartbeat_once(&self) -> Option<HealthStatus> {
        self.state.tick().await
    }

    /// Publishes an `OFFLINE` record so operators see the node going away.
    pub async fn mark_offline(&self) -> bool {
        let status = self.state.build_status(Some(HealthState::Offline)).await;
        self.state.publish(&status).await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    pub fn interval(&self) -> Duration {
        self.state.interval
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
