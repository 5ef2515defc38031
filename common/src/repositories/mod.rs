// Typed views of the consistency store

pub mod execution;
pub mod job;
pub mod task;

pub use execution::ExecutionRepository;
pub use job::JobRepository;
pub use task::TaskRepository;

use crate::errors::StoreError;
use crate::store::{KeyValue, KvStore};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Join a prefix and a child key with exactly one separator
pub fn child_key(prefix: &str, child: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), child)
}

/// Prefix selecting every child of `prefix`
pub fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

pub(crate) fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T, StoreError> {
    Ok(serde_json::from_str(&kv.value)?)
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(kv) => Ok(Some(decode(&kv)?)),
        None => Ok(None),
    }
}

pub(crate) async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    let res = store.get_prefix(prefix).await?;
    let mut items = Vec::with_capacity(res.kvs.len());
    for kv in &res.kvs {
        match decode(kv) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable value"),
        }
    }
    Ok(items)
}

pub(crate) async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<i64, StoreError> {
    let body = serde_json::to_string(value)?;
    store.put(key, &body, None).await
}
