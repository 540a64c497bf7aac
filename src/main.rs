mod app;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipeline_domain::chain::ChainDescriptor;
use pipeline_domain::AttemptStatus;

use crate::app::App;
use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "pipeline-scheduler",
    about = "Task-chain expansion and dependency-driven scheduling for science pipelines"
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler sweep and the heartbeat monitor.
    Run,
    /// Validate and submit a chain descriptor file.
    Submit {
        /// JSON chain descriptor.
        file: PathBuf,
    },
    /// Show attempt counts, queue depth and blocked tasks, or the
    /// derived state of one task.
    Status {
        /// Task id to inspect.
        #[arg(long)]
        task: Option<i64>,
    },
    /// Re-publish queued attempts whose queue message was lost.
    Requeue,
    /// Discard every message in the work queue.
    PurgeQueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let app = App::build(&config).await.context("initializing pipeline")?;

    match cli.command {
        Command::Run => run(&app).await,
        Command::Submit { file } => submit(&app, &file).await,
        Command::Status { task } => status(&app, task).await,
        Command::Requeue => requeue(&app).await,
        Command::PurgeQueue => purge_queue(&app).await,
    }
}

async fn run(app: &App) -> Result<()> {
    let scheduler = app.scheduler.clone();
    let monitor = app.heartbeat_monitor.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });
    let monitor_handle = tokio::spawn(async move { monitor.start().await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    app.scheduler.stop().await;
    app.heartbeat_monitor.stop().await;
    let _ = scheduler_handle.await;
    let _ = monitor_handle.await;
    app.db.close().await;
    Ok(())
}

async fn submit(app: &App, file: &std::path::Path) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let descriptor = ChainDescriptor::from_json(&json).context("parsing chain descriptor")?;
    let persisted = app.scheduler.submit(&descriptor).await?;
    println!(
        "submitted: root task {}, {} tasks, {} products",
        persisted.task_ids.first().copied().unwrap_or(-1),
        persisted.task_ids.len(),
        persisted.product_ids.len()
    );
    Ok(())
}

async fn status(app: &App, task: Option<i64>) -> Result<()> {
    if let Some(task_id) = task {
        let state = app.scheduler.task_state(task_id).await?;
        println!("task {task_id}: {state:?}");
        return Ok(());
    }

    println!("tasks: {}", app.tasks.count_all().await?);
    for (job, status, count) in app.attempts.count_by_status().await? {
        let job = job.as_deref().unwrap_or("-");
        println!("attempts [{job}] {status}: {count}");
    }
    println!("queue depth: {}", app.queue.pending().await?);
    let blocked = app.scheduler.blocked_tasks().await?;
    for report in &blocked {
        println!(
            "blocked: task {} ({}) after {} attempts",
            report.task.id, report.task.task_type, report.attempt_count
        );
        for dep in &report.dependents {
            println!("  wedged: task {} ({})", dep.id, dep.task_type);
        }
    }
    if blocked.is_empty() {
        println!("no blocked tasks");
    }
    Ok(())
}

async fn requeue(app: &App) -> Result<()> {
    let queued = app.attempts.find_with_status(AttemptStatus::Queued).await?;
    for attempt in &queued {
        app.queue.publish(attempt.id).await?;
    }
    println!("requeued {} attempts", queued.len());
    Ok(())
}

async fn purge_queue(app: &App) -> Result<()> {
    let discarded = app.queue.purge().await?;
    println!("discarded {discarded} messages");
    Ok(())
}
