//! scrape_cluster: coordination of distributed scraping work.
//!
//! This library lets a fleet of scraper nodes share one stream of jobs over
//! Redis: distributed locks, load-aware distribution, retry scheduling,
//! heartbeats, failure detection with work migration, cluster status and
//! graceful shutdown.

// Core modules
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cluster::{Coordinator, WorkItem, WorkStatus};
pub use config::{ClusterConfig, ConfigError};
pub use error::{CoordinatorError, CoordinatorResult};
