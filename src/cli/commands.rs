//! CLI command definitions for scrape-cluster.
//!
//! Operator commands for inspecting and steering a running cluster: status
//! snapshots, job distribution, dead node cleanup, retry requeueing and a
//! long-running maintenance agent.

use crate::cluster::{Coordinator, WorkItem};
use crate::config::ClusterConfig;
use crate::metrics::{export_metrics, init_metrics};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Coordination tool for a fleet of scraper nodes sharing one Redis store.
#[derive(Parser)]
#[command(name = "scrape-cluster")]
#[command(about = "Coordinate distributed scraping work over Redis")]
#[command(version)]
#[command(
    long_about = "scrape-cluster inspects and steers a cluster of scraper nodes.\n\nWork items are spread over healthy nodes, dead nodes are detected through their heartbeats and their work is moved to live nodes.\n\nExample usage:\n  scrape-cluster distribute --file jobs.json\n  scrape-cluster status --pretty"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Identity of this node. Generated from the host name when absent.
    #[arg(long, env = "CLUSTER_NODE_ID", global = true)]
    pub node_id: Option<String>,

    /// Prefix of every coordination key.
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print a cluster status snapshot as JSON.
    Status(StatusArgs),

    /// Distribute jobs from a JSON or YAML file over the healthy nodes.
    #[command(alias = "dist")]
    Distribute(DistributeArgs),

    /// Run one failure detection pass and migrate work of dead nodes.
    Cleanup,

    /// Redistribute due retries and the unassigned pool.
    Requeue,

    /// Heartbeat, clean up dead nodes and requeue retries until Ctrl-C.
    ///
    /// The agent does not process work itself. It heartbeats as OFFLINE, so
    /// it stays visible to the cluster but is never assigned work.
    Agent(AgentArgs),
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Pretty-print the JSON output.
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Parser, Debug)]
pub struct DistributeArgs {
    /// JSON (or YAML, by extension) file holding a list of jobs.
    #[arg(short = 'f', long)]
    pub file: String,
}

#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Print Prometheus metrics after shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// One entry of a job file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub work_id: Option<String>,
    pub city: String,
    pub url: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    /// Builds a pending work item, generating an id when none is given.
    pub fn into_work_item(self) -> WorkItem {
        let mut item = match self.work_id {
            Some(id) if !id.trim().is_empty() => WorkItem::new(id, self.city, self.url),
            _ => WorkItem::generated(self.city, self.url),
        };
        if let Some(priority) = self.priority {
            item = item.with_priority(priority);
        }
        if let Some(max_retries) = self.max_retries {
            item = item.with_max_retries(max_retries);
        }
        item
    }
}

/// Reads a list of [`JobSpec`] from `path`.
///
/// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else as
/// a JSON array.
pub fn load_jobs(path: &Path) -> anyhow::Result<Vec<WorkItem>> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read job file {}: {}", path.display(), e))?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let specs: Vec<JobSpec> = if is_yaml {
        serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid job file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid job file {}: {}", path.display(), e))?
    };

    Ok(specs.into_iter().map(JobSpec::into_work_item).collect())
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    match cli.command {
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Distribute(args) => run_distribute_command(config, args).await,
        Commands::Cleanup => run_cleanup_command(config).await,
        Commands::Requeue => run_requeue_command(config).await,
        Commands::Agent(args) => run_agent_command(config, args).await,
    }
}

/// Environment configuration overridden by global flags.
fn build_config(cli: &Cli) -> anyhow::Result<ClusterConfig> {
    let mut config = ClusterConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(node_id) = &cli.node_id {
        config = config.with_node_id(node_id.clone());
    }
    if let Some(prefix) = &cli.key_prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", output);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_status_command(config: ClusterConfig, args: StatusArgs) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let status = coordinator.cluster_status().await;
    print_json(&status, args.pretty)
}

async fn run_distribute_command(config: ClusterConfig, args: DistributeArgs) -> anyhow::Result<()> {
    let items = load_jobs(Path::new(&args.file))?;
    if items.is_empty() {
        warn!(file = %args.file, "Job file is empty");
    }

    let coordinator = Coordinator::connect(config).await?;
    let result = coordinator.distribute(items).await;
    if result.failed > 0 {
        warn!(failed = result.failed, "Some jobs could not be distributed");
    }
    print_json(&result, true)
}

async fn run_cleanup_command(config: ClusterConfig) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let report = coordinator.cleanup_stale_nodes().await;
    print_json(&report, true)
}

async fn run_requeue_command(config: ClusterConfig) -> anyhow::Result<()> {
    let coordinator = Coordinator::connect(config).await?;
    let result = coordinator.requeue_pending().await;
    print_json(&result, true)
}

async fn run_agent_command(config: ClusterConfig, args: AgentArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let cleanup_interval = config.cleanup_interval;
    let coordinator = Coordinator::connect(config).await?;
    info!(node_id = %coordinator.node_id(), "Agent started, press Ctrl-C to stop");

    // The agent does not scrape, so it heartbeats without taking work.
    coordinator.start_standby_monitor();
    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
                }
                break;
            }
            _ = ticker.tick() => {
                let report = coordinator.cleanup_stale_nodes().await;
                let requeued = coordinator.requeue_pending().await;
                if report.nodes_cleaned > 0 || requeued.total > 0 {
                    info!(
                        nodes_cleaned = report.nodes_cleaned,
                        items_recovered = report.items_recovered,
                        requeued = requeued.distributed,
                        "Maintenance pass"
                    );
                }
            }
        }
    }

    let report = coordinator.coordinate_shutdown().await;
    print_json(&report, true)?;

    if args.print_metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}
