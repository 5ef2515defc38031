// Bounded queue of jobs awaiting validation

use crate::errors::QueueError;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Job hashes owned by the validation pipeline
///
/// A hash stays registered from `push` until `done`, including while it
/// waits for a delayed requeue, so repeated pushes of the same job are
/// ignored instead of piling up.
pub struct SchedulerQueue {
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pending: Mutex<HashSet<String>>,
    next_timeout: Duration,
    requeue_delay: Duration,
}

impl SchedulerQueue {
    pub fn new(capacity: usize, next_timeout: Duration, requeue_delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(HashSet::new()),
            next_timeout,
            requeue_delay,
        }
    }

    /// Enqueue a job; false when it is already in the pipeline
    pub async fn push(&self, hash: &str) -> Result<bool, QueueError> {
        if !self.register(hash) {
            return Ok(false);
        }
        if self.tx.capacity() == 0 {
            warn!(hash, "Scheduler queue full, waiting for room");
        }
        if self.tx.send(hash.to_string()).await.is_err() {
            self.done(hash);
            return Err(QueueError::Closed);
        }
        Ok(true)
    }

    /// Put a job back after the requeue delay; it stays registered meanwhile
    pub fn requeue_later(&self, hash: String, cancel: CancellationToken) {
        let tx = self.tx.clone();
        let delay = self.requeue_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if tx.send(hash.clone()).await.is_err() {
                        debug!(hash = %hash, "Scheduler queue closed before requeue");
                    }
                }
            }
        });
    }

    /// Release a job from the pipeline
    pub fn done(&self, hash: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
    }

    pub fn is_pending(&self, hash: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
    }

    /// Forget every registered job, used when a new pipeline starts
    pub fn reset(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Next job to validate
    ///
    /// Returns `Ok(None)` when nothing arrives within the wait timeout so the
    /// caller can check for cancellation.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<String>, QueueError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            res = tokio::time::timeout(self.next_timeout, rx.recv()) => match res {
                Err(_) => Ok(None),
                Ok(Some(hash)) => Ok(Some(hash)),
                Ok(None) => Err(QueueError::Closed),
            },
        }
    }

    fn register(&self, hash: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string())
    }
}
