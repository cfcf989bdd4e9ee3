//! CLI command definitions for patchforge.
//!
//! Every command opens the same SQLite file, so `enqueue` on one host and
//! `work` on several others coordinate through the database alone.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ForgeConfig;
use crate::llm::{LlmFixer, OpenRouterProvider};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::patterns::PatternStore;
use crate::ratelimit::RateLimiterRegistry;
use crate::repair::{
    CommandVerifier, FixerSet, RepairOrchestrator, RepairPayload, TracingReporter,
};
use crate::scheduler::{JobQueue, JobState, NewJob, Priority, WorkerPool, DEFAULT_RESOURCE_KEY};
use crate::storage::Database;

/// Durable repair queue for failing builds.
#[derive(Parser)]
#[command(name = "patchforge")]
#[command(about = "Queue failing work units and repair them with escalating LLM fixers")]
#[command(version)]
#[command(
    long_about = "patchforge keeps a durable queue of work units whose verification fails.\n\nWorkers claim jobs, ask a primary fixer for a patch, re-run verification, and escalate to a secondary fixer before giving up. Fixes that work are remembered by error fingerprint.\n\nExample usage:\n  patchforge enqueue ISSUE-42 --workdir ./checkout --task \"Add left-pad\"\n  patchforge work --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "PATCHFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database file. Overrides the configuration.
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Add a work unit to the repair queue.
    Enqueue(EnqueueArgs),

    /// Run workers that claim and repair queued jobs.
    Work(WorkArgs),

    /// Show a job's current state.
    Status(JobArgs),

    /// Show a job's event log.
    Events(JobArgs),

    /// Show queue statistics and recent jobs.
    Queue(QueueArgs),

    /// Show learned error patterns by category.
    Patterns,

    /// Print a Prometheus snapshot of queue metrics.
    Metrics,
}

/// Arguments for `patchforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// External key of the work unit (ticket id, branch name, ...).
    pub key: String,

    /// Working directory the verification command runs in.
    #[arg(short, long)]
    pub workdir: PathBuf,

    /// Description of the work, passed to fixers.
    #[arg(short, long)]
    pub task: Option<String>,

    /// Resource the job occupies while claimed (repository, environment, ...).
    #[arg(short, long, default_value = DEFAULT_RESOURCE_KEY)]
    pub resource_key: String,

    /// Scheduling priority (critical, high, normal, low).
    #[arg(short, long, default_value = "normal")]
    pub priority: Priority,

    /// Comma-separated paths already changed in the working directory.
    #[arg(long, value_delimiter = ',')]
    pub changed_files: Vec<String>,
}

/// Arguments for `patchforge work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of workers. Overrides the configuration.
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Verification command. Overrides the configuration.
    #[arg(long)]
    pub verify_command: Option<String>,

    /// Stop once the queue has nothing claimable.
    #[arg(long)]
    pub exit_when_idle: bool,

    /// LLM API key.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

/// Arguments for commands that address one job.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id returned by `enqueue`.
    pub id: i64,
}

/// Arguments for `patchforge queue`.
#[derive(Parser, Debug)]
pub struct QueueArgs {
    /// Only list jobs in this state (queued, claimed, done, failed).
    #[arg(short, long)]
    pub state: Option<JobState>,

    /// Number of recent jobs to list.
    #[arg(long, default_value = "20")]
    pub limit: u32,
}

/// Parse CLI arguments without running the command.
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
    let mut config = ForgeConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Work(args) => run_work_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Events(args) => run_events_command(config, args).await,
        Commands::Queue(args) => run_queue_command(config, args).await,
        Commands::Patterns => run_patterns_command(config).await,
        Commands::Metrics => run_metrics_command(config).await,
    }
}

async fn open_database(config: &ForgeConfig) -> anyhow::Result<Database> {
    config.validate().context("Invalid configuration")?;
    Database::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

// ============================================================================
// Enqueue
// ============================================================================

#[derive(Debug, Serialize)]
struct EnqueueOutput {
    id: i64,
    key: String,
    resource_key: String,
    priority: Priority,
}

async fn run_enqueue_command(config: ForgeConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let workdir = std::fs::canonicalize(&args.workdir).with_context(|| {
        format!("Working directory does not exist: {}", args.workdir.display())
    })?;
    if !workdir.is_dir() {
        anyhow::bail!("Not a directory: {}", workdir.display());
    }

    let mut payload = RepairPayload::new(workdir);
    payload.task = args.task;
    payload.changed_files = args
        .changed_files
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    let db = open_database(&config).await?;
    let queue = JobQueue::new(db);
    let job = NewJob::new(args.key.clone(), payload.to_value())
        .with_priority(args.priority)
        .with_resource_key(args.resource_key.clone());
    let id = queue.enqueue(job).await.context("Failed to enqueue job")?;

    info!(job_id = id, key = %args.key, "Job enqueued");
    print_json(&EnqueueOutput {
        id,
        key: args.key,
        resource_key: args.resource_key,
        priority: args.priority,
    })
}

// ============================================================================
// Work
// ============================================================================

fn build_orchestrator(
    config: &ForgeConfig,
    db: Database,
) -> anyhow::Result<RepairOrchestrator> {
    let api_key = config
        .require_api_key()
        .context("An LLM API key is required to run workers")?;
    let provider = Arc::new(
        OpenRouterProvider::with_custom_url(
            api_key,
            config.fixers.api_base.clone(),
            config.fixers.primary_model.clone(),
        )
        .context("Failed to create LLM provider")?,
    );

    let primary = LlmFixer::new("primary", provider.clone(), config.fixers.primary_model.clone())
        .with_temperature(config.fixers.temperature)
        .with_max_tokens(config.fixers.max_tokens);
    let secondary = LlmFixer::new("secondary", provider, config.fixers.secondary_model.clone())
        .with_temperature(config.fixers.temperature)
        .with_max_tokens(config.fixers.max_tokens);

    let verifier = Arc::new(CommandVerifier::new(
        config.verify.command.clone(),
        config.verify.timeout(),
    ));
    let limiter = Arc::new(RateLimiterRegistry::from_config(config.rate_limits.clone()));

    let orchestrator = RepairOrchestrator::new(
        JobQueue::new(db.clone()),
        PatternStore::with_config(db, config.patterns.clone()),
        FixerSet::new(Arc::new(primary), Arc::new(secondary)),
        verifier,
        config.repair.clone(),
    )
    .with_rate_limiter(limiter)
    .with_reporter(Arc::new(TracingReporter));

    Ok(orchestrator)
}

async fn run_work_command(mut config: ForgeConfig, args: WorkArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.worker.num_workers = workers;
    }
    if let Some(command) = args.verify_command {
        config.verify.command = command;
    }
    if config.fixers.api_key.is_none() {
        config.fixers.api_key = args.api_key;
    }
    config.worker.exit_when_idle = args.exit_when_idle;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let db = open_database(&config).await?;
    let orchestrator = Arc::new(build_orchestrator(&config, db)?);

    let mut pool = WorkerPool::new(config.worker.clone(), orchestrator);
    pool.start().context("Failed to start worker pool")?;
    info!(
        workers = config.worker.num_workers,
        verify_command = %config.verify.command,
        primary_model = %config.fixers.primary_model,
        secondary_model = %config.fixers.secondary_model,
        "Workers running"
    );

    if config.worker.exit_when_idle {
        pool.join().await.context("Worker pool failed")?;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutdown requested");
        pool.shutdown().await.context("Worker pool shutdown failed")?;
    }

    let stats = pool.stats();
    info!(
        done = stats.jobs_done,
        failed = stats.jobs_failed,
        released = stats.jobs_released,
        success_rate = stats.success_rate(),
        "Workers stopped"
    );
    Ok(())
}

// ============================================================================
// Read-only projections
// ============================================================================

async fn run_status_command(config: ForgeConfig, args: JobArgs) -> anyhow::Result<()> {
    let queue = JobQueue::new(open_database(&config).await?);
    let job = queue
        .get_job(args.id)
        .await
        .context("Failed to load job")?
        .with_context(|| format!("No job with id {}", args.id))?;
    print_json(&job)
}

async fn run_events_command(config: ForgeConfig, args: JobArgs) -> anyhow::Result<()> {
    let queue = JobQueue::new(open_database(&config).await?);
    if queue.get_job(args.id).await?.is_none() {
        anyhow::bail!("No job with id {}", args.id);
    }
    let events = queue.events(args.id).await.context("Failed to load events")?;
    print_json(&events)
}

async fn run_queue_command(config: ForgeConfig, args: QueueArgs) -> anyhow::Result<()> {
    let queue = JobQueue::new(open_database(&config).await?);
    let stats = queue.stats().await.context("Failed to read queue stats")?;

    println!(
        "queued: {}  claimed: {}  done: {}  failed: {}  total: {}",
        stats.queued,
        stats.claimed,
        stats.done,
        stats.failed,
        stats.total_jobs()
    );
    for (priority, count) in &stats.queued_by_priority {
        println!("  queued {:<8} {}", priority.to_string(), count);
    }
    for (resource, count) in &stats.claimed_by_resource {
        println!("  claimed on {:<20} {}", resource, count);
    }

    let jobs = queue.list_jobs(args.state, args.limit).await?;
    if !jobs.is_empty() {
        println!();
        println!(
            "{:>6}  {:<8}  {:<8}  {:>8}  {:<16}  key",
            "id", "state", "priority", "attempts", "resource"
        );
    }
    for job in jobs {
        println!(
            "{:>6}  {:<8}  {:<8}  {:>8}  {:<16}  {}",
            job.id,
            job.state.as_str(),
            job.priority.to_string(),
            job.attempts,
            job.resource_key,
            job.key
        );
    }
    Ok(())
}

async fn run_patterns_command(config: ForgeConfig) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let store = PatternStore::with_config(db, config.patterns.clone());
    let stats = store
        .stats_by_category()
        .await
        .context("Failed to read pattern stats")?;

    if stats.is_empty() {
        println!("No patterns recorded yet.");
        return Ok(());
    }

    println!(
        "{:<20}  {:>8}  {:>9}  {:>8}",
        "category", "patterns", "successes", "failures"
    );
    for row in stats {
        println!(
            "{:<20}  {:>8}  {:>9}  {:>8}",
            row.category.as_str(),
            row.patterns,
            row.successes,
            row.failures
        );
    }
    Ok(())
}

async fn run_metrics_command(config: ForgeConfig) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let queue = JobQueue::new(open_database(&config).await?);
    publish_queue_depth(&queue).await?;
    print!("{}", export_metrics());
    Ok(())
}

async fn publish_queue_depth(queue: &JobQueue) -> anyhow::Result<()> {
    let stats = queue.stats().await.context("Failed to read queue stats")?;
    let metrics = MetricsCollector::new();
    metrics.update_queue_depth(JobState::Queued.as_str(), stats.queued);
    metrics.update_queue_depth(JobState::Claimed.as_str(), stats.claimed);
    metrics.update_queue_depth(JobState::Done.as_str(), stats.done);
    metrics.update_queue_depth(JobState::Failed.as_str(), stats.failed);
    Ok(())
}
