// Worker binary entry point: per-node task runner

use anyhow::Result;
use common::config::Settings;
use common::lock::StoreLocker;
use common::repositories::{ExecutionRepository, JobRepository};
use common::runner::{JobRunner, NodeTaskRunner, ProcessExecutor};
use common::store;
use common::supervisor::spawn_supervised;
use common::telemetry;
use common::watch::Watcher;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(&settings.observability.log_level)?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(node_id = %settings.node.id, "Starting fleet worker");

    let store = store::connect(&settings.store).await.map_err(|e| {
        error!(error = %e, "Failed to connect to the consistency store");
        anyhow::anyhow!("Store connection error: {}", e)
    })?;

    if let Some(dir) = &settings.worker.log_dir {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            error!(path = %dir.display(), error = %e, "Failed to create job log directory");
            anyhow::anyhow!("Log directory error: {}", e)
        })?;
    }

    let jobs = JobRepository::new(store.clone(), &settings.paths.jobs);
    let jobs_prefix = jobs.watch_prefix();
    let job_runner = Arc::new(JobRunner::new(
        jobs,
        ExecutionRepository::new(store.clone(), &settings.paths.records),
        StoreLocker::new(
            store.clone(),
            &settings.paths.locks,
            settings.lock.max_ttl_seconds,
        ),
        Arc::new(ProcessExecutor::new(settings.worker.log_dir.clone())),
    ));
    let runner = Arc::new(NodeTaskRunner::new(
        &settings.node.id,
        job_runner,
        Watcher::new(store, &settings.watch),
        jobs_prefix,
    ));

    let shutdown = CancellationToken::new();
    let (errors_tx, mut errors_rx) = mpsc::channel(4);
    let handle = {
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        spawn_supervised("node_task_runner", errors_tx, async move {
            runner.run(shutdown).await
        })
    };

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received, initiating graceful shutdown");
            Ok(())
        }
        Some(e) = errors_rx.recv() => {
            error!(error = %e, "Fatal runtime error");
            Err(anyhow::anyhow!("Fatal runtime error: {}", e))
        }
    };

    shutdown.cancel();
    let _ = handle.await;
    info!("Worker shutdown complete");
    outcome
}
