//! CLI command definitions for resque-pool.
//!
//! `run` starts the pool and blocks until shutdown. The other commands are
//! one-shot operations against the queue store.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use crate::config::{
    interval_from_secs, parse_queue_list, ConfigError, PoolConfig, DEFAULT_REDIS_URL,
    ENV_NAMESPACE, ENV_REDIS_URL,
};
use crate::metrics;
use crate::scheduler::inspect::{self, StoreStats};
use crate::scheduler::job::{FailureRecord, Job};
use crate::scheduler::queue::{Keys, RedisQueueStore, DEFAULT_NAMESPACE};
use crate::scheduler::{PoolSupervisor, ShutdownSignals};

/// Default number of failure records printed by `failures`.
const DEFAULT_FAILURE_LIMIT: usize = 10;

/// Resque-compatible worker pool.
#[derive(Parser)]
#[command(name = "resque-pool")]
#[command(about = "Run Resque jobs from Redis queues as isolated subprocesses")]
#[command(version)]
#[command(
    long_about = "resque-pool polls Resque queues in Redis with a fixed number of workers per queue and runs each job as an executable under a scripts directory.\n\nExample usage:\n  resque-pool run --queues mail,reports --workers 2 --scripts ./scripts"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the worker pool and block until SIGINT, SIGTERM or SIGHUP.
    Run(RunArgs),

    /// Push a job onto a queue.
    Enqueue(EnqueueArgs),

    /// Show processed/failed counters, registered workers and queue depths.
    Stats(StatsArgs),

    /// Show the most recent failure records.
    Failures(FailuresArgs),
}

/// Arguments for `resque-pool run`.
///
/// Every option overrides the matching environment variable.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Comma-separated queues to consume [env: RESQUE_QUEUES].
    #[arg(short, long)]
    pub queues: Option<String>,

    /// Workers per queue [env: RESQUE_WORKERS].
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Poll interval in seconds, fractions allowed [env: RESQUE_INTERVAL].
    #[arg(short, long)]
    pub interval: Option<f64>,

    /// Redis connection URL [env: REDIS_URL].
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Directory job classes are resolved against [env: RESQUE_SCRIPTS].
    #[arg(short, long)]
    pub scripts: Option<PathBuf>,

    /// Key namespace [env: RESQUE_NAMESPACE].
    #[arg(long)]
    pub namespace: Option<String>,

    /// Write Prometheus metrics to this file [env: RESQUE_METRICS_FILE].
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl RunArgs {
    /// Applies the command-line overrides on top of `config`.
    pub fn apply(self, mut config: PoolConfig) -> Result<PoolConfig, ConfigError> {
        if let Some(queues) = self.queues {
            config.queues = parse_queue_list(&queues);
        }
        if let Some(workers) = self.workers {
            config.workers_per_queue = workers;
        }
        if let Some(secs) = self.interval {
            config.poll_interval = interval_from_secs(secs, "--interval")?;
        }
        if let Some(url) = self.redis_url {
            config.redis_url = url;
        }
        if let Some(scripts) = self.scripts {
            config.scripts_root = scripts;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(path) = self.metrics_file {
            config.metrics_path = Some(path);
        }
        Ok(config)
    }
}

/// Store connection options shared by the one-shot commands.
#[derive(clap::Args, Debug)]
pub struct StoreArgs {
    /// Redis connection URL.
    #[arg(long, env = ENV_REDIS_URL, default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Key namespace.
    #[arg(long, env = ENV_NAMESPACE, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
}

impl StoreArgs {
    async fn connect(&self) -> anyhow::Result<(RedisQueueStore, Keys)> {
        let store = RedisQueueStore::connect(&self.redis_url)
            .await
            .with_context(|| format!("Failed to connect to {}", self.redis_url))?;
        Ok((store, Keys::new(self.namespace.clone())))
    }
}

/// Arguments for `resque-pool enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue to push onto.
    pub queue: String,

    /// Job class: the script path relative to the scripts root.
    pub class: String,

    /// Job arguments. Each is parsed as JSON, or taken as a string if it is not valid JSON.
    pub args: Vec<String>,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `resque-pool stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `resque-pool failures`.
#[derive(Parser, Debug)]
pub struct FailuresArgs {
    /// Number of records to show, newest first.
    #[arg(short = 'n', long, default_value_t = DEFAULT_FAILURE_LIMIT)]
    pub limit: usize,

    /// Output as JSON.
    #[arg(short, long)]
    pub json: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pool_command(args).await,
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Failures(args) => run_failures_command(args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_pool_command(args: RunArgs) -> anyhow::Result<()> {
    let config = PoolConfig::from_env().context("Failed to read configuration from environment")?;
    let config = args.apply(config)?.resolve_paths()?;
    config.validate()?;

    metrics::init_metrics().context("Failed to initialize metrics")?;

    info!(
        queues = ?config.queues,
        workers_per_queue = config.workers_per_queue,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        scripts_root = %config.scripts_root.display(),
        "Starting worker pool"
    );

    if !config.scripts_root.is_dir() {
        tracing::warn!(
            scripts_root = %config.scripts_root.display(),
            "Scripts root does not exist; every job will fail with ScriptNotFound"
        );
    }

    // Listen before registering so an early signal still unregisters workers
    let signals = ShutdownSignals::install().context("Failed to install signal handlers")?;

    let supervisor = PoolSupervisor::connect(&config)
        .await
        .context("Failed to start worker pool")?;

    let reason = supervisor.run_with_signals(signals).await;
    info!(reason = %reason, "Worker pool exited");
    Ok(())
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let (store, keys) = args.store.connect().await?;
    let job = Job::new(args.class, args.args.iter().map(|a| parse_job_arg(a)).collect());

    inspect::enqueue(&store, &keys, &args.queue, &job)
        .await
        .with_context(|| format!("Failed to enqueue onto '{}'", args.queue))?;

    println!("Enqueued {} on {}", job.target, args.queue);
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let (store, keys) = args.store.connect().await?;
    let stats = inspect::stats(&store, &keys)
        .await
        .context("Failed to read stats")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", render_stats(&stats));
    }
    Ok(())
}

async fn run_failures_command(args: FailuresArgs) -> anyhow::Result<()> {
    let (store, keys) = args.store.connect().await?;
    let records = inspect::recent_failures(&store, &keys, args.limit)
        .await
        .context("Failed to read failures")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No failures recorded");
    } else {
        for record in &records {
            print!("{}", render_failure(record));
        }
    }
    Ok(())
}

/// Interprets a command-line job argument as JSON, falling back to a string.
fn parse_job_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render_stats(stats: &StoreStats) -> String {
    let mut out = String::new();
    out.push_str("=== Resque Stats ===\n");
    out.push_str(&format!("Processed:      {}\n", stats.processed));
    out.push_str(&format!("Failed:         {}\n", stats.failed));
    out.push_str(&format!("Failure list:   {}\n", stats.failures_recorded));
    out.push_str(&format!("Pending:        {}\n", stats.pending()));
    out.push_str(&format!(
        "Workers:        {} ({} busy)\n",
        stats.workers.len(),
        stats.busy_workers()
    ));

    if !stats.queues.is_empty() {
        out.push_str("\nQueues:\n");
        for depth in &stats.queues {
            out.push_str(&format!("  {:<24} {}\n", depth.queue, depth.pending));
        }
    }

    if !stats.workers.is_empty() {
        out.push_str("\nWorkers:\n");
        for worker in &stats.workers {
            match &worker.working_on {
                Some(record) => out.push_str(&format!(
                    "  {}  working on {} since {}\n",
                    worker.identity,
                    record.payload.target,
                    record.run_at.to_rfc3339()
                )),
                None => out.push_str(&format!("  {}  idle\n", worker.identity)),
            }
        }
    }

    out
}

fn render_failure(record: &FailureRecord) -> String {
    format!(
        "{}  {}  {}: {}\n    worker: {}\n",
        record.failed_at.to_rfc3339(),
        record.payload.target,
        value_text(&record.exception),
        value_text(&record.error),
        record.worker
    )
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::inspect::{QueueDepth, WorkerSnapshot};
    use crate::scheduler::job::{Classification, WorkerIdentity, WorkingOnRecord};
    use clap::CommandFactory;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["resque-pool", "run"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert!(args.queues.is_none());
                assert!(args.workers.is_none());
                assert!(args.interval.is_none());
                assert!(args.metrics_file.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_overrides_environment_config() {
        let cli = Cli::try_parse_from([
            "resque-pool",
            "run",
            "--queues",
            "mail, reports",
            "-w",
            "3",
            "--interval",
            "0.5",
            "--namespace",
            "staging",
            "--metrics-file",
            "/tmp/pool.prom",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };

        let base = PoolConfig::default().with_redis_url("redis://env:6379");
        let config = args.apply(base).expect("apply");

        assert_eq!(config.queues, vec!["mail", "reports"]);
        assert_eq!(config.workers_per_queue, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.namespace, "staging");
        assert_eq!(config.redis_url, "redis://env:6379");
        assert_eq!(config.metrics_path, Some(PathBuf::from("/tmp/pool.prom")));
    }

    #[test]
    fn test_run_rejects_negative_interval() {
        let args = RunArgs {
            interval: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            args.apply(PoolConfig::default()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_enqueue_command_parses_args() {
        let cli = Cli::try_parse_from([
            "resque-pool",
            "enqueue",
            "mail",
            "mailers/welcome",
            "42",
            "alice@example.com",
            r#"{"vip":true}"#,
            "--namespace",
            "staging",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.queue, "mail");
                assert_eq!(args.class, "mailers/welcome");
                assert_eq!(args.store.namespace, "staging");
                let values: Vec<Value> = args.args.iter().map(|a| parse_job_arg(a)).collect();
                assert_eq!(
                    values,
                    vec![json!(42), json!("alice@example.com"), json!({"vip": true})]
                );
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_failures_command_defaults() {
        let cli = Cli::try_parse_from(["resque-pool", "failures", "-n", "3", "--json"])
            .expect("should parse");

        match cli.command {
            Commands::Failures(args) => {
                assert_eq!(args.limit, 3);
                assert!(args.json);
            }
            _ => panic!("Expected Failures command"),
        }
    }

    #[test]
    fn test_render_stats() {
        let stats = StoreStats {
            processed: 5,
            failed: 2,
            failures_recorded: 2,
            queues: vec![QueueDepth {
                queue: "mail".to_string(),
                pending: 4,
            }],
            workers: vec![
                WorkerSnapshot {
                    identity: "box:1-0:mail".to_string(),
                    started: None,
                    working_on: Some(WorkingOnRecord::new("mail", Job::new("Welcome", vec![]))),
                },
                WorkerSnapshot {
                    identity: "box:1-1:mail".to_string(),
                    started: None,
                    working_on: None,
                },
            ],
        };

        let text = render_stats(&stats);
        assert!(text.contains("Processed:      5"));
        assert!(text.contains("Pending:        4"));
        assert!(text.contains("Workers:        2 (1 busy)"));
        assert!(text.contains("box:1-0:mail  working on Welcome"));
        assert!(text.contains("box:1-1:mail  idle"));
    }

    #[test]
    fn test_render_failure() {
        let record = FailureRecord::new(
            Job::new("Report", vec![]),
            &WorkerIdentity::new("box", 1, 0, "reports"),
            Classification::named("Timeout", "db"),
        );

        let text = render_failure(&record);
        assert!(text.contains("Report  Timeout: db"));
        assert!(text.contains("worker: box:1-0:reports"));
    }
}
