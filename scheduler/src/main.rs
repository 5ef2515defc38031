// Scheduler binary entry point: master candidate

use anyhow::Result;
use common::config::Settings;
use common::errors::ElectionError;
use common::leader::{LeaderElector, LeadershipHandler, StoreLeaderElector};
use common::registry::{NodeRegistry, StaticNodeRegistry};
use common::scheduler::MasterRole;
use common::store;
use common::telemetry;
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

    info!(
        node_id = %settings.node.id,
        backend = ?settings.store.backend,
        "Starting fleet scheduler"
    );

    let store = store::connect(&settings.store).await.map_err(|e| {
        error!(error = %e, "Failed to connect to the consistency store");
        anyhow::anyhow!("Store connection error: {}", e)
    })?;

    let nodes: Arc<dyn NodeRegistry> =
        Arc::new(StaticNodeRegistry::from_config(&settings.cluster.nodes));
    info!(nodes = settings.cluster.nodes.len(), "Node registry initialized");

    let (errors_tx, mut errors_rx) = mpsc::channel(16);
    let master: Arc<dyn LeadershipHandler> = Arc::new(MasterRole::new(
        settings.clone(),
        store.clone(),
        nodes,
        errors_tx,
    ));
    let elector = StoreLeaderElector::new(
        store,
        &settings.paths.master_key,
        &settings.node.id,
        settings.scheduler.master_lease_ttl_seconds,
    );

    let shutdown = CancellationToken::new();
    let mut election = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { elector.run(master, shutdown).await })
    };

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received, resigning");
            shutdown.cancel();
            election_result(election.await)
        }
        Some(e) = errors_rx.recv() => {
            error!(error = %e, "Fatal runtime error");
            shutdown.cancel();
            let _ = election.await;
            Err(anyhow::anyhow!("Fatal runtime error: {}", e))
        }
        joined = &mut election => election_result(joined),
    };

    info!("Scheduler stopped");
    outcome
}

fn election_result(
    joined: Result<Result<(), ElectionError>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Leader election ended");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Election task failed: {}", e)),
    }
}
