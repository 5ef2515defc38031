// Consistency store abstraction: revisions, leases, compare-and-create, watch

pub mod memory;
pub mod redis;

use crate::config::{StoreBackend, StoreConfig};
use crate::errors::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

pub type Revision = i64;
pub type LeaseId = i64;

/// A stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    /// Lease the key is attached to, 0 when none
    #[serde(default)]
    pub lease: LeaseId,
}

/// Result of a range read, taken at a single revision
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEventType {
    Put,
    Delete,
}

/// One change in the store's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub event_type: StoreEventType,
    /// For deletes, `value` is empty and `mod_revision` is the delete revision
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl StoreEvent {
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }

    /// A put whose key did not exist before this revision
    pub fn is_create(&self) -> bool {
        self.event_type == StoreEventType::Put && self.kv.create_revision == self.kv.mod_revision
    }
}

/// A batch of events delivered by a raw watch
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    pub events: Vec<StoreEvent>,
}

pub type WatchStream = BoxStream<'static, Result<WatchResponse, StoreError>>;

/// Contract of the coordination store
///
/// Reads are linearizable and report the revision they were taken at.
/// A watch started at revision `r > 0` delivers every change with
/// `mod_revision >= r`; `r == 0` starts after the current revision. When
/// `r` has been compacted the stream yields `StoreError::Compacted`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse, StoreError>;

    /// Write a key, optionally attached to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>)
        -> Result<Revision, StoreError>;

    /// Atomically create a key; returns false when it already exists
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError>;

    /// Delete one key; returns the number of deleted keys
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    async fn grant(&self, ttl_seconds: i64) -> Result<LeaseId, StoreError>;

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Drop a lease and every key attached to it
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    async fn watch(
        &self,
        key: &str,
        from_revision: Revision,
        prefix: bool,
    ) -> Result<WatchStream, StoreError>;
}

/// Whether `key` is selected by a watch or range on `target`
pub fn key_matches(key: &str, target: &str, prefix: bool) -> bool {
    if prefix {
        key.starts_with(target)
    } else {
        key == target
    }
}

/// Build the store selected by configuration
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::with_history_limit(
            config.history_limit,
        ))),
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(config).await?)),
    }
}
