// Job repository implementation

use super::{child_key, dir_prefix, get_json, list_json, put_json};
use crate::errors::StoreError;
use crate::models::Job;
use crate::store::{KvStore, Revision};
use std::sync::Arc;
use tracing::instrument;

/// Jobs stored under `<prefix>/<hash>`
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl JobRepository {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, hash: &str) -> String {
        child_key(&self.prefix, hash)
    }

    /// Prefix to watch for every job
    pub fn watch_prefix(&self) -> String {
        dir_prefix(&self.prefix)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, hash: &str) -> Result<Option<Job>, StoreError> {
        get_json(self.store.as_ref(), &self.key(hash)).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, hash = %job.hash))]
    pub async fn put(&self, job: &Job) -> Result<Revision, StoreError> {
        put_json(self.store.as_ref(), &self.key(&job.hash), job).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, hash: &str) -> Result<u64, StoreError> {
        self.store.delete(&self.key(hash)).await
    }

    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        list_json(self.store.as_ref(), &self.watch_prefix()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::create_job_from_task;
    use crate::models::{Shell, Task, TaskTemplate};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_put_get_delete_by_hash() {
        let repo = JobRepository::new(Arc::new(MemoryStore::new()), "/fleet/jobs");
        let task = Task::new(
            "t1",
            TaskTemplate {
                shell: Shell {
                    cmd: vec!["true".to_string()],
                },
                ..Default::default()
            },
        );
        let job = create_job_from_task(&task, "n1").unwrap();

        repo.put(&job).await.unwrap();
        assert_eq!(repo.get(&job.hash).await.unwrap(), Some(job.clone()));
        assert_eq!(repo.list().await.unwrap().len(), 1);

        assert_eq!(repo.delete(&job.hash).await.unwrap(), 1);
        assert!(repo.get(&job.hash).await.unwrap().is_none());
    }
}
