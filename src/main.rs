use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use clusterline::api::HttpCollaborators;
use clusterline::cluster::ClusterEngine;
use clusterline::collab::Providers;
use clusterline::config::{self, ClusterlineConfig};
use clusterline::ledger::TaskLedger;
use clusterline::log::parse_log_level;
use clusterline::queue::{MemoryQueue, WorkQueue};
use clusterline::recovery::{run_sweep_loop, Recovery};
use clusterline::store::Store;
use clusterline::types::Stage;
use clusterline::worker::{run_worker, WorkerContext};
use clusterline::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(name = "clusterline", about = "Staged product pipeline with incremental clustering")]
struct Cli {
    /// Path to config file
    #[arg(long, default_value = "clusterline.toml")]
    config: PathBuf,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init,
    /// Run the stage workers and the recovery sweep until interrupted
    Run,
    /// Seed products into the pipeline (marketplace:external_id ...)
    Seed {
        /// Products as marketplace:external_id pairs
        #[arg(required = true)]
        products: Vec<String>,
    },
    /// Show task, product, and cluster counts
    Status,
    /// Reset a dead-lettered task to pending for re-processing
    Replay {
        /// Ledger task id
        task_id: i64,
    },
    /// Run one recovery pass against the database and exit
    Sweep,
}

// --- Shutdown signal plumbing ---

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Bridge the signal flag into a CancellationToken the workers select on.
fn spawn_shutdown_watch(cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if shutdown_flag().load(Ordering::Relaxed) {
                log_info!("shutdown requested, draining in-flight work");
                cancel.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => clusterline::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Init => handle_init(&cli.config),
        Commands::Run => handle_run(&cli.config).await,
        Commands::Seed { products } => handle_seed(&cli.config, &products).await,
        Commands::Status => handle_status(&cli.config).await,
        Commands::Replay { task_id } => handle_replay(&cli.config, task_id).await,
        Commands::Sweep => handle_sweep(&cli.config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<ClusterlineConfig, String> {
    config::load(path).map_err(|e| e.to_string())
}

async fn open_store(config: &ClusterlineConfig) -> Result<Store, String> {
    Store::open(Path::new(&config.database.path))
        .await
        .map_err(|e| e.to_string())
}

fn handle_init(config_path: &Path) -> Result<(), String> {
    if config_path.exists() {
        return Err(format!(
            "{} already exists; refusing to overwrite",
            config_path.display()
        ));
    }
    config::write_starter(config_path).map_err(|e| e.to_string())?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

async fn handle_run(config_path: &Path) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let ledger = TaskLedger::new(&store);
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(config.queue.capacity));

    let collaborators = Arc::new(
        HttpCollaborators::new(
            &config.providers,
            Duration::from_secs(config.execution.collaborator_timeout_secs),
        )
        .map_err(|e| e.to_string())?,
    );
    let providers = Providers {
        listing: collaborators.clone(),
        tagging: collaborators.clone(),
        lookalike: collaborators.clone(),
        similarity: collaborators,
    };

    let engine = ClusterEngine::new(&store, &config.clustering);
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        ledger: ledger.clone(),
        queue: Arc::clone(&queue),
        providers,
        engine,
        execution: config.execution.clone(),
    });

    install_signal_handlers()?;
    let cancel = CancellationToken::new();
    spawn_shutdown_watch(cancel.clone());

    let recovery = Recovery::new(&store, ledger, Arc::clone(&queue), &config.execution);
    let sweep_handle = tokio::spawn(run_sweep_loop(
        recovery,
        Duration::from_secs(config.execution.sweep_interval_secs),
        cancel.clone(),
    ));

    let mut worker_handles = Vec::new();
    for stage in Stage::ALL {
        worker_handles.push(tokio::spawn(run_worker(
            stage,
            Arc::clone(&ctx),
            cancel.clone(),
        )));
    }

    for handle in worker_handles {
        match handle.await {
            Ok(summary) => log_info!(
                "worker summary: {} handled, {} succeeded, {} dead-lettered",
                summary.handled,
                summary.succeeded,
                summary.dead_lettered
            ),
            Err(e) => log_error!("worker task panicked: {}", e),
        }
    }
    let _ = sweep_handle.await;

    Ok(())
}

async fn handle_seed(config_path: &Path, products: &[String]) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let ledger = TaskLedger::new(&store);

    let run_id = format!("run-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let mut seeded = 0usize;

    for entry in products {
        let Some((marketplace, external_id)) = entry.split_once(':') else {
            log_warn!("skipping '{}': expected marketplace:external_id", entry);
            continue;
        };
        if marketplace.is_empty() || external_id.is_empty() {
            log_warn!("skipping '{}': empty marketplace or external id", entry);
            continue;
        }

        store
            .seed_product(marketplace, external_id)
            .await
            .map_err(|e| e.to_string())?;
        let task = ledger
            .enqueue(external_id, Stage::Ingest, &run_id)
            .await
            .map_err(|e| e.to_string())?;
        log_info!("seeded {} (task {})", external_id, task.id);
        seeded += 1;
    }

    println!(
        "Seeded {} product(s) under {}; a running `clusterline run` picks them up on its next sweep",
        seeded, run_id
    );
    Ok(())
}

async fn handle_status(config_path: &Path) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;

    let task_counts = store.task_counts().await.map_err(|e| e.to_string())?;
    println!("Tasks:");
    if task_counts.is_empty() {
        println!("  (none)");
    }
    for (stage, status, n) in &task_counts {
        println!("  {:<8} {:<14} {}", stage.to_string(), status.to_string(), n);
    }

    let product_counts = store.product_counts().await.map_err(|e| e.to_string())?;
    println!("Products:");
    if product_counts.is_empty() {
        println!("  (none)");
    }
    for (status, n) in &product_counts {
        println!("  {:<14} {}", status.to_string(), n);
    }

    let (clusters, members, sales) = store.cluster_totals().await.map_err(|e| e.to_string())?;
    println!("Clusters:");
    println!("  clusters      {}", clusters);
    println!("  members       {}", members);
    println!("  total sales   {}", sales);
    Ok(())
}

async fn handle_replay(config_path: &Path, task_id: i64) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let ledger = TaskLedger::new(&store);

    let envelope = ledger.replay(task_id).await.map_err(|e| e.to_string())?;
    println!(
        "Task {} reset to pending ({} / {}); a running `clusterline run` picks it up on its next sweep",
        envelope.task_id, envelope.product_external_id, envelope.stage
    );
    Ok(())
}

async fn handle_sweep(config_path: &Path) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config).await?;
    let ledger = TaskLedger::new(&store);
    // The queue here is local to this process: the sweep repairs ledger state,
    // and re-emitted envelopes reach workers via the running process's sweep.
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(config.queue.capacity));

    let recovery = Recovery::new(&store, ledger, queue, &config.execution);
    let report = recovery.run_once().await.map_err(|e| e.to_string())?;
    println!(
        "Recovery pass: {} reclaimed, {} reconciled, {} re-emitted",
        report.reclaimed, report.reconciled, report.re_emitted
    );
    Ok(())
}
