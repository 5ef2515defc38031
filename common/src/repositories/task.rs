// Task and task group repository implementation

use super::{child_key, dir_prefix, get_json, list_json, put_json};
use crate::errors::StoreError;
use crate::models::{Task, TaskGroup};
use crate::store::{KvStore, Revision};
use std::sync::Arc;
use tracing::instrument;

#[derive(Clone)]
pub struct TaskRepository {
    store: Arc<dyn KvStore>,
    tasks_prefix: String,
    groups_prefix: String,
}

impl TaskRepository {
    pub fn new(
        store: Arc<dyn KvStore>,
        tasks_prefix: impl Into<String>,
        groups_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tasks_prefix: tasks_prefix.into(),
            groups_prefix: groups_prefix.into(),
        }
    }

    pub fn tasks_watch_prefix(&self) -> String {
        dir_prefix(&self.tasks_prefix)
    }

    #[instrument(skip(self))]
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        get_json(self.store.as_ref(), &child_key(&self.tasks_prefix, id)).await
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn put_task(&self, task: &Task) -> Result<Revision, StoreError> {
        put_json(self.store.as_ref(), &child_key(&self.tasks_prefix, &task.id), task).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        list_json(self.store.as_ref(), &self.tasks_watch_prefix()).await
    }

    #[instrument(skip(self))]
    pub async fn get_group(&self, id: &str) -> Result<Option<TaskGroup>, StoreError> {
        get_json(self.store.as_ref(), &child_key(&self.groups_prefix, id)).await
    }

    #[instrument(skip(self, group), fields(group_id = %group.id))]
    pub async fn put_group(&self, group: &TaskGroup) -> Result<Revision, StoreError> {
        put_json(self.store.as_ref(), &child_key(&self.groups_prefix, &group.id), group).await
    }
}
