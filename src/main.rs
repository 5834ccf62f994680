use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use archivd::config::AppConfig;
use archivd::context::AppContext;
use archivd::core::{CaptureMethod, JobSnapshot, NewTarget, StartOutcome, StatusReport};
use archivd::logging::{self, LogConfig};
use archivd::rpc::{RpcClient, RpcServer};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Extra time, on top of the kill grace, that shutdown waits for outcomes
/// to be written.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "archivd")]
#[command(about = "Web and channel archiving daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine, the sweeps and the RPC server until interrupted.
    Daemon(ServerArgs),
    /// Register a new target.
    Add(AddArgs),
    /// Start a crawl for a target.
    Start { id: i64 },
    /// Cancel a target's queued or running crawl.
    Cancel { id: i64 },
    /// Show a target's status and recent log output.
    Status {
        id: i64,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
    /// Clear a target's retry budget and start it again.
    Reset { id: i64 },
    /// List queued and running crawls.
    Active {
        #[arg(long, short = 'n', default_value_t = 0)]
        lines: usize,
    },
    /// Print the effective configuration as TOML.
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    archive_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct AddArgs {
    url: String,

    #[arg(long, value_enum)]
    method: CaptureMethod,

    #[arg(long)]
    name: Option<String>,

    /// Days between scheduled re-crawls. 0 disables recurrence.
    #[arg(long, default_value_t = 30)]
    interval_days: u32,

    /// Mirror only: follow links to other hosts.
    #[arg(long)]
    include_external: bool,

    /// Mirror only: recursion depth, 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    depth: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Daemon(args) | Commands::Config(args) => AppConfig::new(config_file, Some(args))?,
        _ => AppConfig::new(config_file, None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Daemon failed")
        }
        Commands::Config(_) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        command => run_client(&config, command).await,
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.archive_root)
        .await
        .with_context(|| format!("Failed to create {}", config.archive_root.display()))?;

    let ctx = AppContext::open(config).await?;
    let config = ctx.config.clone();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database_path.display(),
        archive_root = %config.archive_root.display(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        "archivd starting"
    );

    ctx.orchestrator
        .recover_orphans()
        .await
        .context("Startup recovery failed")?;

    let shutdown = CancellationToken::new();
    let server = RpcServer::bind(ctx.orchestrator.clone(), config.rpc_bind).await?;
    let server_task = tokio::spawn(server.serve(shutdown.clone()));
    let sweep_tasks = ctx.scheduler.spawn_loops(shutdown.clone());

    wait_for_signal().await?;
    info!("Shutdown requested");
    shutdown.cancel();

    for task in sweep_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Sweep loop ended abnormally");
        }
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "RPC server failed"),
        Err(e) => warn!(error = %e, "RPC server task ended abnormally"),
    }

    if !ctx
        .orchestrator
        .shutdown(config.kill_grace() + SHUTDOWN_SLACK)
        .await
    {
        warn!("Exiting with crawls still running; they will be recovered on next start");
    }
    info!("archivd stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn run_client(config: &AppConfig, command: Commands) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);

    match command {
        Commands::Add(args) => {
            let new = NewTarget {
                url: args.url,
                name: args.name,
                method: args.method,
                recurrence_days: (args.interval_days > 0).then_some(args.interval_days),
                include_external: args.include_external,
                depth: args.depth,
            };
            let target = client.add_target(&new).await?;
            println!("Added target #{} {} ({})", target.id, target.name, target.method);
        }
        Commands::Start { id } => print_start(id, &client.start(id).await?),
        Commands::Reset { id } => {
            let outcome = client.reset(id).await?;
            println!("Target #{} reset", id);
            print_start(id, &outcome);
        }
        Commands::Cancel { id } => {
            let result = client.cancel(id).await?;
            if result.cancelled {
                println!("Cancelling crawl for target #{}", id);
            } else {
                println!("Target #{} has no active crawl", id);
            }
        }
        Commands::Status { id, lines } => print_status(&client.status(id, Some(lines)).await?),
        Commands::Active { lines } => print_active(&client.active(lines).await?),
        Commands::Daemon(_) | Commands::Config(_) => {}
    }
    Ok(())
}

fn print_start(id: i64, outcome: &StartOutcome) {
    match outcome {
        StartOutcome::Started { job_id } => println!("Target #{} started (job {})", id, job_id),
        StartOutcome::Queued { job_id, position } => {
            println!("Target #{} queued at position {} (job {})", id, position, job_id)
        }
        StartOutcome::AlreadyActive { job_id, phase } => {
            println!("Target #{} is already {} (job {})", id, phase, job_id)
        }
    }
}

fn print_status(report: &StatusReport) {
    let target = &report.target;
    println!("#{} {} ({}) {}", target.id, target.name, target.method, target.url);
    println!("  status:     {}", report.status);
    println!("  retries:    {}", target.retry_count);
    if let Some(job) = &report.job {
        let elapsed = job
            .elapsed_secs
            .map(|s| format!(", {}s elapsed", s))
            .unwrap_or_default();
        println!("  attempt:    {}{}", job.attempt, elapsed);
    }
    if let Some(error) = &target.last_error {
        println!("  last error: {}", error);
    }
    if let Some(at) = target.next_run_at {
        println!("  next run:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(at) = target.last_success_at {
        println!("  last ok:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  archived:   {} items, {} bytes", target.item_count, target.size_bytes);

    if !report.log_tail.is_empty() {
        println!();
        for line in &report.log_tail {
            println!("  {}", line);
        }
    }
}

fn print_active(jobs: &[JobSnapshot]) {
    if jobs.is_empty() {
        println!("No active crawls");
        return;
    }
    for job in jobs {
        let elapsed = job
            .elapsed_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<5} {:<9} {:<11} attempt {:<2} {:>8}  {}",
            job.target_id,
            job.phase.as_str(),
            job.method.as_str(),
            job.attempt,
            elapsed,
            job.url
        );
        for line in &job.log_tail {
            println!("        {}", line);
        }
    }
}
