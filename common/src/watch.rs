// Typed watch sessions over the store's raw watch primitive
//
// A session is fed by two tasks joined by a bounded channel: the producer
// talks to the store (snapshot, watch, resync) and the processor turns raw
// changes into typed events for the consumer.

use crate::config::WatchConfig;
use crate::errors::{RuntimeError, StoreError};
use crate::store::{KeyValue, KvStore, Revision, StoreEvent, StoreEventType};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    /// The requested revision has been compacted; restart from revision 0
    Expired,
    InternalError,
}

impl StatusReason {
    pub fn code(&self) -> u16 {
        match self {
            StatusReason::Expired => 410,
            StatusReason::InternalError => 500,
        }
    }
}

/// Terminal status carried by an `Error` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub reason: StatusReason,
    pub code: u16,
    pub message: String,
}

impl WatchStatus {
    fn from_store_error(err: &StoreError) -> Self {
        let reason = if err.is_compacted() {
            StatusReason::Expired
        } else {
            StatusReason::InternalError
        };
        Self {
            reason,
            code: reason.code(),
            message: err.to_string(),
        }
    }
}

/// A typed change notification
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    Added { key: String, value: T },
    Modified { key: String, value: T },
    /// Carries the last value the key held, when it could be decoded
    Deleted { key: String, prev: Option<T> },
    Error(WatchStatus),
}

impl<T> Event<T> {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Added { .. } => EventType::Added,
            Event::Modified { .. } => EventType::Modified,
            Event::Deleted { .. } => EventType::Deleted,
            Event::Error(_) => EventType::Error,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Event::Added { key, .. } | Event::Modified { key, .. } | Event::Deleted { key, .. } => {
                Some(key)
            }
            Event::Error(_) => None,
        }
    }
}

enum Raw {
    Snapshot(KeyValue),
    Change(StoreEvent),
    Failed(StoreError),
}

type Decoder<T> = Arc<dyn Fn(&KeyValue) -> Result<T, StoreError> + Send + Sync>;

/// Consumer side of a running watch
///
/// Dropping the session stops both of its tasks.
pub struct WatchSession<T> {
    rx: mpsc::Receiver<Event<T>>,
    cancel: CancellationToken,
}

impl<T> WatchSession<T> {
    /// Next event, or None once the session is closed
    pub async fn next(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for WatchSession<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Factory of watch sessions over one store
#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn KvStore>,
    resync_interval: Duration,
    buffer_size: usize,
}

impl Watcher {
    pub fn new(store: Arc<dyn KvStore>, config: &WatchConfig) -> Self {
        Self {
            store,
            resync_interval: config.resync_interval(),
            buffer_size: config.buffer_size.max(1),
        }
    }

    /// Watch raw key/values under `key`
    ///
    /// `rev == 0` starts with an `Added` event for every existing key.
    pub fn watch(
        &self,
        key: &str,
        rev: Revision,
        recursive: bool,
        parent: &CancellationToken,
    ) -> WatchSession<KeyValue> {
        self.watch_with(key, rev, recursive, parent, Arc::new(|kv: &KeyValue| Ok(kv.clone())))
    }

    /// Watch JSON documents under a prefix, starting from the current state
    pub fn watch_json<T>(&self, prefix: &str, parent: &CancellationToken) -> WatchSession<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.watch_with(
            prefix,
            0,
            true,
            parent,
            Arc::new(|kv: &KeyValue| serde_json::from_str::<T>(&kv.value).map_err(StoreError::from)),
        )
    }

    /// Feed every JSON change under `prefix` to `handle` until cancelled
    ///
    /// An expired session is restarted from the current state, so handlers
    /// must tolerate replayed `Added` events. Any other watch failure is
    /// returned to the caller.
    pub async fn consume_json<T, F, Fut>(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
        mut handle: F,
    ) -> Result<(), RuntimeError>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(Event<T>) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let mut session = self.watch_json::<T>(prefix, cancel);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    event = session.next() => event,
                };
                match event {
                    Some(Event::Error(status)) if status.reason == StatusReason::Expired => {
                        warn!(prefix, "Watch expired, restarting from current state");
                        break;
                    }
                    Some(Event::Error(status)) => {
                        return Err(RuntimeError::Watch {
                            key: prefix.to_string(),
                            message: status.message,
                        });
                    }
                    Some(event) => handle(event).await,
                    None if cancel.is_cancelled() => return Ok(()),
                    None => {
                        return Err(RuntimeError::Watch {
                            key: prefix.to_string(),
                            message: "watch session closed".to_string(),
                        });
                    }
                }
            }
        }
    }

    fn watch_with<T>(
        &self,
        key: &str,
        rev: Revision,
        recursive: bool,
        parent: &CancellationToken,
        decode: Decoder<T>,
    ) -> WatchSession<T>
    where
        T: Send + 'static,
    {
        let cancel = parent.child_token();
        let (raw_tx, raw_rx) = mpsc::channel(self.buffer_size);
        let (out_tx, out_rx) = mpsc::channel(self.buffer_size);

        let producer = Producer {
            store: self.store.clone(),
            key: key.to_string(),
            recursive,
            resync_interval: self.resync_interval,
            tx: raw_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(producer.run(rev));
        tokio::spawn(process(
            key.to_string(),
            raw_rx,
            out_tx,
            decode,
            cancel.clone(),
        ));

        WatchSession { rx: out_rx, cancel }
    }
}

struct Producer {
    store: Arc<dyn KvStore>,
    key: String,
    recursive: bool,
    resync_interval: Duration,
    tx: mpsc::Sender<Raw>,
    cancel: CancellationToken,
}

enum Outcome {
    Resync,
    Closed,
}

impl Producer {
    async fn run(self, mut rev: Revision) {
        loop {
            match self.watch_once(rev).await {
                Outcome::Resync => {
                    info!(key = %self.key, "Watch resync from current state");
                    rev = 0;
                }
                Outcome::Closed => return,
            }
        }
    }

    async fn watch_once(&self, rev: Revision) -> Outcome {
        let mut start = rev;
        if rev == 0 {
            match self.sync().await {
                Ok(snapshot_rev) => start = snapshot_rev + 1,
                Err(e) => {
                    self.send(Raw::Failed(e)).await;
                    return Outcome::Closed;
                }
            }
        }

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Closed,
            res = self.store.watch(&self.key, start, self.recursive) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    self.send(Raw::Failed(e)).await;
                    return Outcome::Closed;
                }
            },
        };

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Closed,
                item = tokio::time::timeout(self.resync_interval, stream.next()) => item,
            };

            match item {
                Err(_) => {
                    debug!(key = %self.key, "Watch silent for the resync window");
                    return Outcome::Resync;
                }
                Ok(None) => return Outcome::Resync,
                Ok(Some(Err(e))) => {
                    self.send(Raw::Failed(e)).await;
                    return Outcome::Closed;
                }
                Ok(Some(Ok(response))) => {
                    if response.events.is_empty() {
                        return Outcome::Resync;
                    }
                    for event in response.events {
                        if !self.send(Raw::Change(event)).await {
                            return Outcome::Closed;
                        }
                    }
                }
            }
        }
    }

    /// Read the current state and emit it; returns the snapshot revision
    async fn sync(&self) -> Result<Revision, StoreError> {
        let res = self.store.get_prefix(&self.key).await?;
        let kvs = res
            .kvs
            .into_iter()
            .filter(|kv| self.recursive || kv.key == self.key);
        for kv in kvs {
            if !self.send(Raw::Snapshot(kv)).await {
                break;
            }
        }
        Ok(res.revision)
    }

    async fn send(&self, raw: Raw) -> bool {
        if self.tx.capacity() == 0 {
            warn!(
                key = %self.key,
                "Fast watcher, slow processing. Number of buffered events exceeds the buffer size"
            );
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(raw) => res.is_ok(),
        }
    }
}

async fn process<T>(
    key: String,
    mut rx: mpsc::Receiver<Raw>,
    tx: mpsc::Sender<Event<T>>,
    decode: Decoder<T>,
    cancel: CancellationToken,
) where
    T: Send + 'static,
{
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => return,
            raw = rx.recv() => match raw {
                Some(raw) => raw,
                None => return,
            },
        };

        let (event, terminal) = match raw {
            Raw::Snapshot(kv) => (transform_put(&kv, true, &decode), false),
            Raw::Change(change) => (transform(change, &decode), false),
            Raw::Failed(err) => {
                let status = WatchStatus::from_store_error(&err);
                error!(key = %key, reason = ?status.reason, error = %err, "Watch failed");
                (Some(Event::Error(status)), true)
            }
        };

        if let Some(event) = event {
            if tx.capacity() == 0 {
                warn!(key = %key, "Fast watcher, slow consumer. Outgoing buffer is full");
            }
            let delivered = tokio::select! {
                _ = cancel.cancelled() => false,
                res = tx.send(event) => res.is_ok(),
            };
            if !delivered {
                return;
            }
        }

        if terminal {
            cancel.cancel();
            return;
        }
    }
}

fn transform<T>(change: StoreEvent, decode: &Decoder<T>) -> Option<Event<T>> {
    match change.event_type {
        StoreEventType::Put => transform_put(&change.kv, change.is_create(), decode),
        StoreEventType::Delete => {
            let prev = change.prev_kv.as_ref().and_then(|kv| decode(kv).ok());
            Some(Event::Deleted {
                key: change.kv.key,
                prev,
            })
        }
    }
}

fn transform_put<T>(kv: &KeyValue, created: bool, decode: &Decoder<T>) -> Option<Event<T>> {
    match decode(kv) {
        Ok(value) => {
            let key = kv.key.clone();
            Some(if created {
                Event::Added { key, value }
            } else {
                Event::Modified { key, value }
            })
        }
        Err(e) => {
            error!(key = %kv.key, error = %e, "Failed to decode watched value");
            None
        }
    }
}
