// In-process store with revisions, leases and bounded watch history

use super::{
    key_matches, GetResponse, KeyValue, KvStore, LeaseId, Revision, StoreEvent, StoreEventType,
    WatchResponse, WatchStream,
};
use crate::errors::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const DEFAULT_HISTORY_LIMIT: usize = 10_000;
const BROADCAST_CAPACITY: usize = 1024;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Inner {
    revision: Revision,
    /// Highest revision no longer available to watchers
    compacted: Revision,
    data: BTreeMap<String, KeyValue>,
    history: VecDeque<StoreEvent>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

/// Single-process implementation of the store contract
///
/// Every operation runs under one mutex, which makes reads linearizable.
/// Leases run on the tokio clock and are enforced lazily by the next
/// operation after their deadline.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<StoreEvent>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                revision: 0,
                compacted: 0,
                data: BTreeMap::new(),
                history: VecDeque::new(),
                leases: HashMap::new(),
                next_lease: 1,
            })),
            events,
            history_limit: history_limit.max(1),
        }
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Discard watch history up to and including `revision`
    pub fn compact(&self, revision: Revision) {
        let mut inner = self.lock();
        let revision = revision.min(inner.revision);
        while inner
            .history
            .front()
            .map(|event| event.revision() <= revision)
            .unwrap_or(false)
        {
            inner.history.pop_front();
        }
        inner.compacted = inner.compacted.max(revision);
        debug!(compacted = inner.compacted, "Store history compacted");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the data is still consistent
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, inner: &mut Inner, event: StoreEvent) {
        inner.history.push_back(event.clone());
        while inner.history.len() > self.history_limit {
            if let Some(dropped) = inner.history.pop_front() {
                inner.compacted = inner.compacted.max(dropped.revision());
            }
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn remove_key(&self, inner: &mut Inner, key: &str) -> bool {
        let Some(prev) = inner.data.remove(key) else {
            return false;
        };
        if prev.lease != 0 {
            if let Some(lease) = inner.leases.get_mut(&prev.lease) {
                lease.keys.remove(key);
            }
        }
        inner.revision += 1;
        let event = StoreEvent {
            event_type: StoreEventType::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: String::new(),
                create_revision: 0,
                mod_revision: inner.revision,
                lease: 0,
            },
            prev_kv: Some(prev),
        };
        self.record(inner, event);
        true
    }

    fn drop_lease(&self, inner: &mut Inner, id: LeaseId) {
        if let Some(lease) = inner.leases.remove(&id) {
            let mut keys: Vec<String> = lease.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                let attached = inner
                    .data
                    .get(&key)
                    .map(|kv| kv.lease == id)
                    .unwrap_or(false);
                if attached {
                    self.remove_key(inner, &key);
                }
            }
        }
    }

    fn expire_leases(&self, inner: &mut Inner) {
        let now = Instant::now();
        let mut expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            debug!(lease_id = id, "Lease expired");
            self.drop_lease(inner, id);
        }
    }

    fn write(
        &self,
        inner: &mut Inner,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let lease_id = lease.unwrap_or(0);
        if lease_id != 0 && !inner.leases.contains_key(&lease_id) {
            return Err(StoreError::LeaseNotFound(lease_id));
        }

        let prev = inner.data.get(key).cloned();
        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease_id {
                if let Some(old) = inner.leases.get_mut(&prev.lease) {
                    old.keys.remove(key);
                }
            }
        }

        inner.revision += 1;
        let revision = inner.revision;
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(revision),
            mod_revision: revision,
            lease: lease_id,
        };
        if lease_id != 0 {
            if let Some(attached) = inner.leases.get_mut(&lease_id) {
                attached.keys.insert(key.to_string());
            }
        }
        inner.data.insert(key.to_string(), kv.clone());
        self.record(
            inner,
            StoreEvent {
                event_type: StoreEventType::Put,
                kv,
                prev_kv: prev,
            },
        );
        Ok(revision)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        Ok(inner.data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        self.write(&mut inner, key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        if inner.data.contains_key(key) {
            return Ok(false);
        }
        self.write(&mut inner, key, value, lease)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        Ok(u64::from(self.remove_key(&mut inner, key)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        let keys: Vec<String> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        let mut deleted = 0;
        for key in keys {
            if self.remove_key(&mut inner, &key) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        let ttl = Duration::from_secs(ttl_seconds.max(1) as u64);
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);
        if !inner.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        self.drop_lease(&mut inner, lease);
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
        prefix: bool,
    ) -> Result<WatchStream, StoreError> {
        let mut inner = self.lock();
        self.expire_leases(&mut inner);

        let start = if from_revision <= 0 {
            inner.revision + 1
        } else {
            from_revision
        };
        if start <= inner.compacted {
            let err = StoreError::Compacted {
                requested: start,
                compacted: inner.compacted,
            };
            return Ok(futures::stream::once(async move { Err(err) }).boxed());
        }

        let backlog: Vec<StoreEvent> = inner
            .history
            .iter()
            .filter(|event| event.revision() >= start && key_matches(&event.kv.key, key, prefix))
            .cloned()
            .collect();
        // Subscribing under the lock leaves no gap between backlog and live events
        let receiver = self.events.subscribe();
        let live_from = inner.revision + 1;
        drop(inner);

        let target = key.to_string();
        let first = if backlog.is_empty() {
            None
        } else {
            Some(Ok(WatchResponse { events: backlog }))
        };
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let target = target.clone();
            async move {
                match item {
                    Ok(event) => {
                        if event.revision() >= live_from.max(start)
                            && key_matches(&event.kv.key, &target, prefix)
                        {
                            Some(Ok(WatchResponse {
                                events: vec![event],
                            }))
                        } else {
                            None
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(
                        StoreError::Backend(format!("watcher lagged behind by {} events", skipped)),
                    )),
                }
            }
        });

        Ok(futures::stream::iter(first).chain(live).boxed())
    }
}
