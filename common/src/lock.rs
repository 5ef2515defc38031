// Lease-backed distributed locks for job occurrences

use crate::errors::StoreError;
use crate::models::{Job, JobKind};
use crate::repositories::child_key;
use crate::store::{KvStore, LeaseId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Mutual exclusion across the cluster
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once to take `lock_id` for `ttl_seconds`
    ///
    /// `Ok(None)` means another holder owns it, which is not an error.
    async fn acquire(
        &self,
        lock_id: &str,
        kind: JobKind,
        ttl_seconds: i64,
    ) -> Result<Option<JobLock>, StoreError>;
}

/// Lease time for one occurrence of `job`, 0 when the job cannot be locked
///
/// Cycle jobs get the gap between their next two fires, shortened by the
/// average run cost so the lease lapses before the following fire. Interval
/// jobs only shave two seconds. Once-rules use the configured maximum.
pub fn lock_ttl(job: &Job, now: DateTime<Utc>, max_ttl: i64) -> i64 {
    let timer = match job.rule.compiled_timer() {
        Ok(Some(timer)) => timer,
        Ok(None) => return max_ttl.max(1),
        Err(_) => return 0,
    };
    let Some(prev) = timer.next_after(now) else {
        return 0;
    };
    let Some(next) = timer.next_after(prev) else {
        return 0;
    };

    let mut ttl = (next - prev).num_seconds();
    if ttl <= 0 {
        return 0;
    }

    if job.kind == JobKind::Interval {
        ttl -= 2;
        return ttl.min(max_ttl).max(1);
    }

    let cost = (job.avg_time.max(0) + 999) / 1000;
    if ttl >= cost {
        ttl -= cost;
    }
    ttl.min(max_ttl).max(2)
}

/// Locker using compare-and-create on `<locks>/<id>` keys attached to a lease
#[derive(Clone)]
pub struct StoreLocker {
    store: Arc<dyn KvStore>,
    prefix: String,
    max_ttl: i64,
}

impl StoreLocker {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, max_ttl: i64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_ttl,
        }
    }

    /// Lock the current occurrence of a job, keyed by job and rule id
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = ?job.kind))]
    pub async fn lock_job(&self, job: &Job) -> Result<Option<JobLock>, StoreError> {
        let ttl = lock_ttl(job, Utc::now(), self.max_ttl);
        if ttl == 0 {
            warn!(job_id = %job.id, timer = %job.rule.timer, "Job rule yields no lock ttl");
            return Ok(None);
        }
        self.acquire(&job.entry_id(), job.kind, ttl).await
    }
}

#[async_trait]
impl DistributedLock for StoreLocker {
    #[instrument(skip(self), fields(lock_id = %lock_id))]
    async fn acquire(
        &self,
        lock_id: &str,
        kind: JobKind,
        ttl_seconds: i64,
    ) -> Result<Option<JobLock>, StoreError> {
        let key = child_key(&self.prefix, lock_id);
        let lease = self.store.grant(ttl_seconds).await?;

        let created = self
            .store
            .put_if_absent(&key, &Utc::now().to_rfc3339(), Some(lease))
            .await?;
        if !created {
            debug!(key = %key, "Lock held elsewhere");
            if let Err(e) = self.store.revoke(lease).await {
                warn!(key = %key, error = %e, "Failed to revoke unused lease");
            }
            return Ok(None);
        }

        let keep_alive = if kind == JobKind::Alone {
            Some(spawn_keep_alive(self.store.clone(), lease, ttl_seconds))
        } else {
            None
        };

        debug!(key = %key, lease, ttl_seconds, "Lock acquired");
        Ok(Some(JobLock {
            key,
            lease,
            ttl: ttl_seconds,
            kind,
            store: self.store.clone(),
            keep_alive,
        }))
    }
}

fn spawn_keep_alive(
    store: Arc<dyn KvStore>,
    lease: LeaseId,
    ttl_seconds: i64,
) -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let period_ms = (ttl_seconds.max(1) as u64 * 1000).saturating_sub(500).max(100);
    let period = Duration::from_millis(period_ms);

    let cancel = token.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = store.keep_alive_once(lease).await {
                        warn!(lease, error = %e, "Lock keep-alive failed");
                        return;
                    }
                }
            }
        }
    });
    (token, handle)
}

/// A held lock
///
/// Dropping it stops the keep-alive and lets the lease lapse; `unlock`
/// revokes the lease of an `Alone` lock immediately.
pub struct JobLock {
    key: String,
    lease: LeaseId,
    ttl: i64,
    kind: JobKind,
    store: Arc<dyn KvStore>,
    keep_alive: Option<(CancellationToken, JoinHandle<()>)>,
}

impl JobLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub async fn unlock(mut self) -> Result<(), StoreError> {
        if self.kind != JobKind::Alone {
            return Ok(());
        }
        if let Some((token, handle)) = self.keep_alive.take() {
            token.cancel();
            let _ = handle.await;
        }
        self.store.revoke(self.lease).await
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Some((token, _)) = self.keep_alive.take() {
            token.cancel();
        }
    }
}
