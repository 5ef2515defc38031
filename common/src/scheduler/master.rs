// Master role: everything that only runs on the elected scheduler

use super::engine::TaskEngine;
use super::reconciler::RecordReconciler;
use crate::config::Settings;
use crate::datacenter::DataCenterConfig;
use crate::errors::RuntimeError;
use crate::leader::LeadershipHandler;
use crate::lock::{DistributedLock, StoreLocker};
use crate::registry::NodeRegistry;
use crate::repositories::ExecutionRepository;
use crate::store::KvStore;
use crate::supervisor::spawn_supervised;
use crate::watch::Watcher;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct ActiveMaster {
    engine: Arc<TaskEngine>,
    handles: Vec<JoinHandle<()>>,
}

/// Starts TaskEngine, scheduler, reconciler and config watch on election
pub struct MasterRole {
    settings: Settings,
    store: Arc<dyn KvStore>,
    nodes: Arc<dyn NodeRegistry>,
    errors: mpsc::Sender<RuntimeError>,
    active: Mutex<Option<ActiveMaster>>,
}

impl MasterRole {
    pub fn new(
        settings: Settings,
        store: Arc<dyn KvStore>,
        nodes: Arc<dyn NodeRegistry>,
        errors: mpsc::Sender<RuntimeError>,
    ) -> Self {
        Self {
            settings,
            store,
            nodes,
            errors,
            active: Mutex::new(None),
        }
    }

    /// The running engine while this process is master
    pub async fn engine(&self) -> Option<Arc<TaskEngine>> {
        self.active.lock().await.as_ref().map(|a| a.engine.clone())
    }

    async fn start(&self, leadership: CancellationToken) -> Result<ActiveMaster, RuntimeError> {
        let datacenter = Arc::new(DataCenterConfig::new(
            self.store.clone(),
            &self.settings.paths.global_config,
        )?);
        datacenter.load().await?;

        let engine = Arc::new(TaskEngine::new(
            &self.settings,
            self.store.clone(),
            self.nodes.clone(),
            datacenter.clone(),
        ));
        engine.load_static_tasks().await;
        let mut handles = engine.start(leadership.clone(), self.errors.clone()).await?;

        let watcher = Watcher::new(self.store.clone(), &self.settings.watch);
        let locker: Arc<dyn DistributedLock> = Arc::new(StoreLocker::new(
            self.store.clone(),
            &self.settings.paths.locks,
            self.settings.lock.max_ttl_seconds,
        ));
        let reconciler = RecordReconciler::new(
            engine.clone(),
            ExecutionRepository::new(self.store.clone(), &self.settings.paths.records),
            locker,
            watcher.clone(),
            self.settings.lock.record_lock_ttl_seconds,
        );
        let token = leadership.clone();
        handles.push(spawn_supervised(
            "record_reconciler",
            self.errors.clone(),
            async move { reconciler.run(token).await },
        ));

        handles.push(spawn_supervised(
            "config_watch",
            self.errors.clone(),
            async move { datacenter.watch(&watcher, leadership).await },
        ));

        Ok(ActiveMaster { engine, handles })
    }
}

#[async_trait]
impl LeadershipHandler for MasterRole {
    async fn on_acquired(&self, leadership: CancellationToken) {
        info!(node_id = %self.settings.node.id, "Master role acquired");
        match self.start(leadership).await {
            Ok(active) => *self.active.lock().await = Some(active),
            Err(e) => {
                error!(error = %e, "Failed to start master role");
                let _ = self.errors.send(e).await;
            }
        }
    }

    async fn on_lost(&self) {
        if let Some(active) = self.active.lock().await.take() {
            // The leadership token already stopped every loop
            for handle in active.handles {
                let _ = handle.await;
            }
        }
        info!(node_id = %self.settings.node.id, "Master role released");
    }
}
