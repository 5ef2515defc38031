// Leader election behind an injected capability

use crate::errors::ElectionError;
use crate::store::KvStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Callbacks of the component that only runs while leader
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// Leadership gained; `leadership` is cancelled when it ends
    ///
    /// Must return promptly: long-running work is spawned and tied to the token.
    async fn on_acquired(&self, leadership: CancellationToken);

    async fn on_lost(&self);
}

/// A consensus backend able to elect one leader among candidates
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Campaign until elected, then hold leadership until `shutdown` or loss
    ///
    /// Losing leadership returns `ElectionError::LeadershipLost`; shutdown
    /// returns `Ok(())` after resigning.
    async fn run(
        &self,
        handler: Arc<dyn LeadershipHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ElectionError>;
}

/// Master lock held as a leased key created with compare-and-create
pub struct StoreLeaderElector {
    store: Arc<dyn KvStore>,
    key: String,
    candidate: String,
    ttl_seconds: i64,
}

impl StoreLeaderElector {
    pub fn new(
        store: Arc<dyn KvStore>,
        key: impl Into<String>,
        candidate: impl Into<String>,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            candidate: candidate.into(),
            ttl_seconds: ttl_seconds.max(1),
        }
    }

    fn renew_period(&self) -> Duration {
        Duration::from_millis((self.ttl_seconds as u64 * 1000 / 3).max(100))
    }

    /// One campaign round; the lease id when elected
    async fn campaign(&self) -> Result<Option<i64>, ElectionError> {
        let lease = self.store.grant(self.ttl_seconds).await?;
        if self
            .store
            .put_if_absent(&self.key, &self.candidate, Some(lease))
            .await?
        {
            return Ok(Some(lease));
        }
        if let Err(e) = self.store.revoke(lease).await {
            warn!(error = %e, "Failed to revoke campaign lease");
        }
        Ok(None)
    }
}

#[async_trait]
impl LeaderElector for StoreLeaderElector {
    #[instrument(skip(self, handler, shutdown), fields(key = %self.key, candidate = %self.candidate))]
    async fn run(
        &self,
        handler: Arc<dyn LeadershipHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), ElectionError> {
        let period = self.renew_period();

        let lease = loop {
            if let Some(lease) = self.campaign().await? {
                break lease;
            }
            debug!("Master lock held by another candidate");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {}
            }
        };

        info!(lease, "Master lock acquired");
        let leadership = shutdown.child_token();
        handler.on_acquired(leadership.clone()).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    leadership.cancel();
                    if let Err(e) = self.store.revoke(lease).await {
                        warn!(error = %e, "Failed to resign master lock");
                    }
                    info!("Master lock released on shutdown");
                    return Ok(());
                }
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.store.keep_alive_once(lease).await {
                        error!(error = %e, "Master lock lost");
                        leadership.cancel();
                        handler.on_lost().await;
                        return Err(ElectionError::LeadershipLost(e.to_string()));
                    }
                }
            }
        }
    }
}
