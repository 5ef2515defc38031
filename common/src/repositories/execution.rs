// Execution record repository implementation

use super::{child_key, dir_prefix, get_json, list_json, put_json};
use crate::errors::StoreError;
use crate::models::ExecutionRecord;
use crate::store::{KvStore, Revision};
use std::sync::Arc;
use tracing::instrument;

/// Records stored under `<prefix>/<job_id>/<record_id>`
#[derive(Clone)]
pub struct ExecutionRepository {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl ExecutionRepository {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, job_id: &str, record_id: &str) -> String {
        child_key(&child_key(&self.prefix, job_id), record_id)
    }

    pub fn watch_prefix(&self) -> String {
        dir_prefix(&self.prefix)
    }

    /// Append a new record; fails if one with the same id exists
    #[instrument(skip(self, record), fields(job_id = %record.job_id, record_id = %record.id))]
    pub async fn create(&self, record: &ExecutionRecord) -> Result<bool, StoreError> {
        let body = serde_json::to_string(record)?;
        self.store
            .put_if_absent(&self.key(&record.job_id, &record.id), &body, None)
            .await
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id, record_id = %record.id))]
    pub async fn update(&self, record: &ExecutionRecord) -> Result<Revision, StoreError> {
        put_json(self.store.as_ref(), &self.key(&record.job_id, &record.id), record).await
    }

    pub async fn get(
        &self,
        job_id: &str,
        record_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        get_json(self.store.as_ref(), &self.key(job_id, record_id)).await
    }

    pub async fn list_for_job(&self, job_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        list_json(self.store.as_ref(), &dir_prefix(&child_key(&self.prefix, job_id))).await
    }

    #[instrument(skip(self))]
    pub async fn delete_for_job(&self, job_id: &str) -> Result<u64, StoreError> {
        self.store
            .delete_prefix(&dir_prefix(&child_key(&self.prefix, job_id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn record(job_id: &str, id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            job_id: job_id.to_string(),
            task_id: "t1".to_string(),
            node_id: "n1".to_string(),
            name: "t1".to_string(),
            command: "true".to_string(),
            output: String::new(),
            success: true,
            begin_time: Utc::now(),
            end_time: Utc::now(),
            is_handled: false,
        }
    }

    #[tokio::test]
    async fn test_records_are_created_once() {
        let repo = ExecutionRepository::new(Arc::new(MemoryStore::new()), "/fleet/records");
        assert!(repo.create(&record("j1", "r1")).await.unwrap());
        assert!(!repo.create(&record("j1", "r1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_for_job_leaves_other_jobs() {
        let repo = ExecutionRepository::new(Arc::new(MemoryStore::new()), "/fleet/records");
        repo.create(&record("j1", "r1")).await.unwrap();
        repo.create(&record("j1", "r2")).await.unwrap();
        repo.create(&record("j10", "r1")).await.unwrap();

        assert_eq!(repo.delete_for_job("j1").await.unwrap(), 2);
        assert!(repo.list_for_job("j1").await.unwrap().is_empty());
        assert_eq!(repo.list_for_job("j10").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_marks_handled() {
        let repo = ExecutionRepository::new(Arc::new(MemoryStore::new()), "/fleet/records");
        let mut rec = record("j1", "r1");
        repo.create(&rec).await.unwrap();
        rec.is_handled = true;
        repo.update(&rec).await.unwrap();
        assert!(repo.get("j1", "r1").await.unwrap().unwrap().is_handled);
    }
}
