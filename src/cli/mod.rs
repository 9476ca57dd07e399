//! Command-line interface for scrape_cluster.
//!
//! Provides commands for cluster status, job distribution, dead node
//! cleanup, retry requeueing and a maintenance agent.

mod commands;

pub use commands::{load_jobs, parse_cli, run, run_with_cli, Cli, JobSpec};
