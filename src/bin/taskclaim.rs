//! taskclaim CLI: run workers and operate the task queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskclaim::config::Config;
use taskclaim::db::Db;
use taskclaim::engine::Worker;
use taskclaim::error::Error;
use taskclaim::model::{NewTask, Status, TaskFilter};
use taskclaim::registry::HttpRegistryClient;
use taskclaim::telemetry::{TelemetryConfig, init_telemetry};
use taskclaim::work::{JsonDirSink, WorkRegistry};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "taskclaim", about = "Distributed task claiming over a shared SQLite queue")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long, global = true, env = "TASKCLAIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until interrupted
    Worker {
        /// Directory of task type TOML files
        #[arg(long)]
        task_types: Option<PathBuf>,
        /// Claiming strategy (fifo, lifo, priority, weighted)
        #[arg(long)]
        strategy: Option<String>,
        /// Worker identifier
        #[arg(long)]
        worker_id: Option<String>,
        /// Write each result to <dir>/<task id>.json
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Queue depth, outcome counts and worker liveness
    Stats,
    /// List workers and their heartbeat age
    Workers,
    /// Requeue claims held by workers that stopped heartbeating
    Reclaim {
        /// Heartbeat age, in seconds, after which a claim is reclaimed
        #[arg(long)]
        stale_after: Option<f64>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Insert a new task
    Submit {
        /// Task type (selects the work function)
        task_type: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Override the worker's retry limit for this task
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List tasks, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<Status>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Filter by claiming worker
        #[arg(long)]
        worker: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Put a claimed or running task back in the queue
    Requeue {
        /// Task ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Worker {
            task_types,
            strategy,
            worker_id,
            results_dir,
        } => cmd_worker(config, task_types, strategy, worker_id, results_dir).await,
        Command::Task { action } => {
            let db = open_db(&config).await?;
            match action {
                TaskAction::Submit {
                    task_type,
                    params,
                    priority,
                    max_retries,
                } => cmd_task_submit(&db, task_type, params, priority, max_retries).await,
                TaskAction::List {
                    status,
                    task_type,
                    worker,
                    limit,
                } => cmd_task_list(&db, status, task_type, worker, limit).await,
                TaskAction::Show { id } => cmd_task_show(&db, &id).await,
                TaskAction::Requeue { id } => cmd_task_requeue(&db, &id).await,
            }
        }
        Command::Stats => cmd_stats(&open_db(&config).await?, config.worker.stale_after).await,
        Command::Workers => {
            cmd_workers(&open_db(&config).await?, config.worker.stale_after).await
        }
        Command::Reclaim { stale_after } => {
            let stale_after = match stale_after {
                Some(secs) => Duration::try_from_secs_f64(secs)?,
                None => config.worker.stale_after,
            };
            cmd_reclaim(&open_db(&config).await?, stale_after, config.worker.max_retries).await
        }
    }
}

async fn open_db(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_worker(
    mut config: Config,
    task_types: Option<PathBuf>,
    strategy: Option<String>,
    worker_id: Option<String>,
    results_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(dir) = task_types {
        config.worker.task_types_dir = Some(dir);
    }
    if let Some(strategy) = strategy {
        config.worker.claiming_strategy = strategy;
    }
    if let Some(id) = worker_id {
        config.worker.worker_id = id;
    }
    if let Some(dir) = results_dir {
        config.worker.results_dir = Some(dir);
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskclaim".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = open_db(&config).await?;

    let dir = config
        .worker
        .task_types_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("task_types"));
    let work = WorkRegistry::load_commands_from_dir(&dir)?;

    let mut worker = Worker::new(db, work, config.worker.clone())?;
    if let Some(ref url) = config.registry.url {
        if config.worker.enable_registry_sync {
            let client = HttpRegistryClient::new(
                url.clone(),
                config.registry.token.clone(),
                config.registry.timeout,
            )?;
            worker = worker.with_registry(Arc::new(client));
        }
    }
    if let Some(ref dir) = config.worker.results_dir {
        worker = worker.with_sink(Arc::new(JsonDirSink::new(dir)));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown_tx.send(true).ok();
    });

    worker.run(shutdown_rx).await?;
    Ok(())
}

async fn cmd_task_submit(
    db: &Db,
    task_type: String,
    params: Option<String>,
    priority: i32,
    max_retries: Option<u32>,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewTask::new(&task_type).parameters(params).priority(priority);
    if let Some(n) = max_retries {
        new = new.max_retries(n);
    }

    let id = db.insert_task(new).await?;
    println!("Queued: {id} ({task_type})");
    Ok(())
}

async fn cmd_task_list(
    db: &Db,
    status: Option<Status>,
    task_type: Option<String>,
    worker: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let mut filter = TaskFilter::default().limit(limit);
    if let Some(status) = status {
        filter = filter.status(status);
    }
    if let Some(task_type) = task_type {
        filter = filter.task_type(task_type);
    }
    if let Some(worker) = worker {
        filter = filter.claimed_by(worker);
    }

    let tasks = db.list_tasks(&filter).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<9}  {:<4}  {:<5}  {:<20}  CREATED",
        "ID", "TYPE", "STATUS", "PRI", "TRIES", "WORKER"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        let short_id = &task.id.to_string()[..8];
        println!(
            "{:<8}  {:<24}  {:<9}  {:<4}  {:<5}  {:<20}  {}",
            short_id,
            truncate(&task.task_type, 24),
            task.status,
            task.priority,
            task.retry_count,
            truncate(task.claimed_by.as_deref().unwrap_or("-"), 20),
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let task = db.resolve_task(id).await?;

    println!("ID:         {}", task.id);
    println!("Type:       {}", task.task_type);
    println!("Status:     {}", task.status);
    println!("Priority:   {}", task.priority);
    println!(
        "Params:     {}",
        serde_json::to_string_pretty(&task.parameters)?
    );
    println!(
        "Retries:    {} / {}",
        task.retry_count,
        task.max_retries
            .map(|n| n.to_string())
            .unwrap_or("default".to_string())
    );
    println!("Worker:     {}", task.claimed_by.as_deref().unwrap_or("-"));
    println!("Created:    {}", task.created_at);
    if let Some(at) = task.claimed_at {
        println!("Claimed:    {at}");
    }
    if let Some(at) = task.started_at {
        println!("Started:    {at}");
    }
    if let Some(at) = task.completed_at {
        println!("Finished:   {at}");
    }
    if let Some(ref err) = task.error_message {
        println!("Error:      {err}");
    }
    if let Some(ref result) = task.result {
        println!("---");
        println!(
            "Result:     {}",
            if result.success { "success" } else { "failure" }
        );
        if let Some(ref payload) = result.payload {
            println!("Payload:    {}", serde_json::to_string_pretty(payload)?);
        }
    }
    Ok(())
}

async fn cmd_task_requeue(db: &Db, id: &str) -> anyhow::Result<()> {
    let task = db.resolve_task(id).await?;
    let not_requeueable = |from: Status| Error::InvalidTransition {
        from: from.to_string(),
        to: Status::Queued.to_string(),
    };
    if !task.status.can_transition_to(Status::Queued) {
        return Err(not_requeueable(task.status).into());
    }
    match db.requeue_task(task.id).await? {
        Some(task) => println!("Requeued: {} (retries so far: {})", task.id, task.retry_count),
        // Finished or released between the lookup and the update.
        None => {
            let current = db.resolve_task(id).await?;
            return Err(not_requeueable(current.status).into());
        }
    }
    Ok(())
}

async fn cmd_stats(db: &Db, stale_after: Duration) -> anyhow::Result<()> {
    let stats = db.stats(stale_after).await?;

    println!("{:<32}  {:<9}  COUNT", "TYPE", "STATUS");
    println!("{}", "-".repeat(52));
    for row in &stats.depth {
        println!(
            "{:<32}  {:<9}  {}",
            truncate(&row.task_type, 32),
            row.status,
            row.count
        );
    }

    println!();
    println!("Completed:  {}", stats.outcomes.completed);
    println!("Failed:     {}", stats.outcomes.failed);
    println!("Retries:    {}", stats.outcomes.retried);
    println!(
        "Workers:    {} ({} stale)",
        stats.workers.len(),
        stats.workers.iter().filter(|w| w.stale).count()
    );
    Ok(())
}

async fn cmd_workers(db: &Db, stale_after: Duration) -> anyhow::Result<()> {
    let stats = db.stats(stale_after).await?;
    if stats.workers.is_empty() {
        println!("No workers have reported.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<32}  {:>8}  {:>9}  {:>6}  STATE",
        "WORKER", "AGE (s)", "PROCESSED", "FAILED"
    );
    println!("{}", "-".repeat(72));
    for worker in &stats.workers {
        println!(
            "{:<32}  {:>8}  {:>9}  {:>6}  {}",
            truncate(&worker.info.worker_id, 32),
            worker.info.heartbeat_age(now).num_seconds(),
            worker.info.tasks_processed,
            worker.info.tasks_failed,
            if worker.stale { "stale" } else { "live" }
        );
    }
    Ok(())
}

async fn cmd_reclaim(db: &Db, stale_after: Duration, max_retries: u32) -> anyhow::Result<()> {
    let tasks = db.reclaim_stale(stale_after, max_retries).await?;
    if tasks.is_empty() {
        println!("No stale claims.");
        return Ok(());
    }
    for task in &tasks {
        println!("{}  {}  -> {}", task.id, task.task_type, task.status);
    }
    println!("\n{} task(s) reclaimed", tasks.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
