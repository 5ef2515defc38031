// Task engine: task/job bookkeeping and the validation loop of the master

use super::criteria::{default_criteria, Criterion, Readiness};
use super::queue::SchedulerQueue;
use crate::config::Settings;
use crate::datacenter::DataCenterConfig;
use crate::errors::{QueueError, RuntimeError, SchedulingError, StoreError};
use crate::job::{create_job_from_task, job_hash};
use crate::models::{
    GroupState, Job, JobScheduler, Rule, RunMode, ScheduleState, SchedulerMode, SchedulerStatus,
    Task, TaskGroup, TaskGroupStatus, TaskStatus, COMPLE_SUCCESS,
};
use crate::registry::NodeRegistry;
use crate::repositories::{ExecutionRepository, JobRepository, TaskRepository};
use crate::store::KvStore;
use crate::supervisor::spawn_supervised;
use crate::telemetry;
use crate::watch::{Event, Watcher};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tunables of the engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Identity written into scheduling decisions
    pub master_id: String,
    pub queue_capacity: usize,
    pub next_timeout: Duration,
    pub requeue_delay: Duration,
    pub static_task_path: Option<PathBuf>,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            master_id: settings.node.id.clone(),
            queue_capacity: settings.scheduler.queue_capacity,
            next_timeout: settings.scheduler.next_timeout(),
            requeue_delay: settings.scheduler.requeue_delay(),
            static_task_path: settings.scheduler.static_task_path.clone(),
        }
    }
}

pub struct TaskEngine {
    options: EngineOptions,
    tasks: TaskRepository,
    jobs: JobRepository,
    records: ExecutionRepository,
    nodes: Arc<dyn NodeRegistry>,
    datacenter: Arc<DataCenterConfig>,
    watcher: Watcher,
    queue: SchedulerQueue,
    criteria: Vec<Box<dyn Criterion>>,
    task_cache: RwLock<HashMap<String, Task>>,
    job_cache: RwLock<HashMap<String, Job>>,
    /// Serializes read-modify-write cycles on tasks
    task_write: tokio::sync::Mutex<()>,
    /// Serializes the run-mode guard of PutSchedul
    schedule_guard: tokio::sync::Mutex<()>,
}

impl TaskEngine {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn KvStore>,
        nodes: Arc<dyn NodeRegistry>,
        datacenter: Arc<DataCenterConfig>,
    ) -> Self {
        let options = EngineOptions::from_settings(settings);
        Self {
            queue: SchedulerQueue::new(
                options.queue_capacity,
                options.next_timeout,
                options.requeue_delay,
            ),
            options,
            tasks: TaskRepository::new(
                store.clone(),
                settings.paths.tasks.clone(),
                settings.paths.task_groups.clone(),
            ),
            jobs: JobRepository::new(store.clone(), settings.paths.jobs.clone()),
            records: ExecutionRepository::new(store.clone(), settings.paths.records.clone()),
            nodes,
            datacenter,
            watcher: Watcher::new(store, &settings.watch),
            criteria: default_criteria(),
            task_cache: RwLock::new(HashMap::new()),
            job_cache: RwLock::new(HashMap::new()),
            task_write: tokio::sync::Mutex::new(()),
            schedule_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn nodes(&self) -> &Arc<dyn NodeRegistry> {
        &self.nodes
    }

    pub fn datacenter(&self) -> &Arc<DataCenterConfig> {
        &self.datacenter
    }

    /// Load tasks and spawn the watch and scheduling loops
    ///
    /// Every loop stops when `cancel` fires; fatal failures are sent on `errors`.
    #[instrument(skip_all)]
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
        errors: mpsc::Sender<RuntimeError>,
    ) -> Result<Vec<JoinHandle<()>>, RuntimeError> {
        self.queue.reset();
        let tasks = self.tasks.list_tasks().await?;
        {
            let mut cache = self.task_cache.write().unwrap_or_else(PoisonError::into_inner);
            cache.clear();
            for task in tasks {
                cache.insert(task.id.clone(), task);
            }
        }
        info!(master_id = %self.options.master_id, "Task engine started");

        let engine = self.clone();
        let token = cancel.clone();
        let task_watch = spawn_supervised("task_watch", errors.clone(), async move {
            engine.watch_tasks(token).await
        });

        let engine = self.clone();
        let token = cancel.clone();
        let job_watch = spawn_supervised("job_watch", errors.clone(), async move {
            engine.watch_jobs(token).await
        });

        let engine = self.clone();
        let scheduler = spawn_supervised("scheduler", errors, async move {
            engine.run_scheduler(cancel).await
        });

        Ok(vec![task_watch, job_watch, scheduler])
    }

    async fn watch_tasks(&self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        self.watcher
            .consume_json::<Task, _, _>(&self.tasks.tasks_watch_prefix(), &cancel, |event| {
                match event {
                    Event::Added { value, .. } | Event::Modified { value, .. } => {
                        self.cache_task(value);
                    }
                    Event::Deleted { key, .. } => {
                        let id = last_segment(&key);
                        debug!(task_id = id, "Task deleted");
                        self.task_cache
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(id);
                    }
                    Event::Error(_) => {}
                }
                std::future::ready(())
            })
            .await
    }

    async fn watch_jobs(&self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        self.watcher
            .consume_json::<Job, _, _>(&self.jobs.watch_prefix(), &cancel, |event| async move {
                match event {
                    Event::Added { value, .. } | Event::Modified { value, .. } => {
                        let hash = value.hash.clone();
                        let enqueue = value.awaiting_validation();
                        self.cache_job(value);
                        if enqueue {
                            if let Err(e) = self.queue.push(&hash).await {
                                warn!(hash = %hash, error = %e, "Failed to enqueue job");
                            }
                        }
                    }
                    Event::Deleted { key, .. } => {
                        self.job_cache
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(last_segment(&key));
                    }
                    Event::Error(_) => {}
                }
            })
            .await
    }

    async fn run_scheduler(&self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        info!("Scheduler loop started");
        loop {
            match self.queue.next(&cancel).await {
                Ok(Some(hash)) => self.schedule_job(&hash, &cancel).await,
                Ok(None) => continue,
                Err(QueueError::Cancelled) | Err(QueueError::Closed) => {
                    info!("Scheduler loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Run one job through the validation pipeline
    #[instrument(skip(self, cancel))]
    async fn schedule_job(&self, hash: &str, cancel: &CancellationToken) {
        // The store, not the cache, decides whether the job still needs validation
        let job = match self.jobs.get(hash).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.queue.done(hash);
                return;
            }
            Err(e) => {
                warn!(hash, error = %e, "Failed to read job, retrying later");
                self.queue.requeue_later(hash.to_string(), cancel.clone());
                return;
            }
        };
        if !job.awaiting_validation() {
            self.queue.done(hash);
            return;
        }

        let task = match self.get_task(&job.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(hash, task_id = %job.task_id, "Task of job not found, dropping job");
                self.queue.done(hash);
                return;
            }
            Err(e) => {
                warn!(hash, error = %e, "Failed to read task, retrying later");
                self.queue.requeue_later(hash.to_string(), cancel.clone());
                return;
            }
        };

        let result = match self.validate(&task, &job).await {
            Ok(Readiness::Ready) => self.release(job, &task).await,
            Ok(Readiness::Waiting(reason)) => self.defer(job, &task, reason, cancel).await,
            Err(SchedulingError::Store(e)) => Err(e),
            Err(e) => {
                self.reject(job, ScheduleState::Failure, e.to_string())
                    .await
            }
        };

        if let Err(e) = result {
            warn!(hash, error = %e, "Store error while scheduling, retrying later");
            self.queue.requeue_later(hash.to_string(), cancel.clone());
        }
    }

    /// Apply every criterion in order, stopping at the first that is not ready
    pub async fn validate(&self, task: &Task, job: &Job) -> Result<Readiness, SchedulingError> {
        for criterion in &self.criteria {
            match criterion.check(self, task, job).await? {
                Readiness::Ready => {
                    debug!(criterion = criterion.name(), job_id = %job.id, "Criterion passed");
                }
                waiting @ Readiness::Waiting(_) => return Ok(waiting),
            }
        }
        Ok(Readiness::Ready)
    }

    fn scheduler_status(&self, state: ScheduleState, message: impl Into<String>) -> SchedulerStatus {
        SchedulerStatus {
            scheduler_master: self.options.master_id.clone(),
            ..SchedulerStatus::new(state, message)
        }
    }

    fn job_scheduler(job: &Job, state: ScheduleState, message: String) -> JobScheduler {
        JobScheduler {
            node_id: job.node_id.clone(),
            scheduler_time: Utc::now(),
            can_run: state == ScheduleState::Success,
            message,
            scheduler_status: state,
            waiting_since: job.scheduler.as_ref().and_then(|s| s.waiting_since),
        }
    }

    async fn release(&self, mut job: Job, task: &Task) -> Result<(), StoreError> {
        if let Err(e) = self.datacenter.render_job(&task.group_id, &mut job) {
            let message = format!("update job config error,{}", e);
            let node_id = job.node_id.clone();
            let status = self.scheduler_status(ScheduleState::Failure, message.clone());
            job.scheduler = Some(Self::job_scheduler(&job, ScheduleState::Failure, message.clone()));
            self.jobs.put(&job).await?;
            self.modify_task_store(&task.id, |t| {
                t.update_node_status(&node_id, TaskStatus::failed(message));
                t.update_scheduler_status(&node_id, status);
            })
            .await?;
            self.queue.done(&job.hash);
            telemetry::record_schedule_outcome("failure");
            return Ok(());
        }

        job.scheduler = Some(Self::job_scheduler(
            &job,
            ScheduleState::Success,
            "success".to_string(),
        ));
        self.jobs.put(&job).await?;
        self.cache_job(job.clone());

        let status = self.scheduler_status(ScheduleState::Success, "success");
        let (node_id, job_id) = (job.node_id.clone(), job.id.clone());
        self.modify_task_store(&task.id, |t| {
            t.update_node_status(&node_id, TaskStatus::started(&job_id));
            t.update_scheduler_status(&node_id, status);
            t.start_time = Some(Utc::now());
        })
        .await?;

        self.queue.done(&job.hash);
        telemetry::record_schedule_outcome("success");
        info!(job_id = %job.id, task_id = %job.task_id, node_id = %job.node_id, "Job can run");
        Ok(())
    }

    async fn defer(
        &self,
        mut job: Job,
        task: &Task,
        reason: String,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let since = job
            .scheduler
            .as_ref()
            .and_then(|s| s.waiting_since)
            .unwrap_or(now);
        if task.time_out > 0 && (now - since).num_seconds() >= task.time_out {
            return self
                .reject(job, ScheduleState::Timeout, "dependency timeout".to_string())
                .await;
        }

        let mut scheduler = Self::job_scheduler(&job, ScheduleState::Waiting, reason.clone());
        scheduler.waiting_since = Some(since);
        job.scheduler = Some(scheduler);
        self.jobs.put(&job).await?;
        self.cache_job(job.clone());

        let already_waiting = task
            .scheduler
            .status
            .get(&job.node_id)
            .map(|s| s.status == ScheduleState::Waiting && s.message == reason)
            .unwrap_or(false);
        if !already_waiting {
            let status = self.scheduler_status(ScheduleState::Waiting, reason);
            let node_id = job.node_id.clone();
            self.modify_task_store(&task.id, |t| t.update_scheduler_status(&node_id, status))
                .await?;
        }

        telemetry::record_schedule_outcome("waiting");
        self.queue.requeue_later(job.hash.clone(), cancel.clone());
        Ok(())
    }

    async fn reject(&self, mut job: Job, state: ScheduleState, message: String) -> Result<(), StoreError> {
        warn!(job_id = %job.id, task_id = %job.task_id, node_id = %job.node_id, state = %state, message = %message, "Job rejected");
        job.scheduler = Some(Self::job_scheduler(&job, state, message.clone()));
        self.jobs.put(&job).await?;
        self.cache_job(job.clone());

        let status = self.scheduler_status(state, message);
        let node_id = job.node_id.clone();
        self.modify_task_store(&job.task_id, |t| t.update_scheduler_status(&node_id, status))
            .await?;

        self.queue.done(&job.hash);
        telemetry::record_schedule_outcome(match state {
            ScheduleState::Timeout => "timeout",
            _ => "failure",
        });
        Ok(())
    }

    /// Create the Job of `task_id` on `node_id`
    ///
    /// Rejected while a same-hash job awaits validation, once a released
    /// cycle job exists, or once an only-once job ran successfully.
    #[instrument(skip(self))]
    pub async fn put_schedul(&self, task_id: &str, node_id: &str) -> Result<Job, SchedulingError> {
        if task_id.is_empty() || node_id.is_empty() {
            return Err(SchedulingError::EmptyIdentity);
        }
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulingError::TaskNotFound(task_id.to_string()))?;
        if self.nodes.get_node(node_id).await.is_none() {
            return Err(SchedulingError::NodeNotFound(node_id.to_string()));
        }

        let hash = job_hash(task_id, node_id);
        let job = {
            let _guard = self.schedule_guard.lock().await;
            if let Some(existing) = self.jobs.get(&hash).await? {
                if existing.awaiting_validation() || blocks_rerun(&existing, task.run_mode) {
                    return Err(SchedulingError::RunModeViolation {
                        task_id: task_id.to_string(),
                        node_id: node_id.to_string(),
                        mode: task.run_mode.to_string(),
                    });
                }
            }

            let job = create_job_from_task(&task, node_id)?;
            self.jobs.put(&job).await?;
            self.cache_job(job.clone());
            job
        };

        let status = self.scheduler_status(ScheduleState::Waiting, "wait validation");
        self.modify_task(task_id, |t| t.update_scheduler_status(node_id, status))
            .await?;
        info!(job_id = %job.id, hash = %job.hash, "Job created");
        Ok(job)
    }

    /// Store a task, keeping the runtime state of an existing one
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn add_task(&self, mut task: Task) -> Result<Task, SchedulingError> {
        let labels = match task.temp.as_ref() {
            Some(temp) => temp.labels.clone(),
            None => return Err(SchedulingError::MissingTemplate),
        };
        if task.id.is_empty() {
            task.id = task.name.clone();
        }
        if task.id.is_empty() {
            return Err(SchedulingError::EmptyIdentity);
        }
        if task.name.is_empty() {
            task.name = task.id.clone();
        }
        Rule {
            id: String::new(),
            mode: task.run_mode,
            timer: task.timer.clone(),
            labels: HashMap::new(),
        }
        .valid()?;

        if task.nodes.is_empty() {
            task.nodes = self
                .nodes
                .nodes_with_labels(&labels)
                .await
                .into_iter()
                .map(|n| n.id)
                .collect();
        }

        {
            let _guard = self.task_write.lock().await;
            if let Some(old) = self.tasks.get_task(&task.id).await? {
                task.status = old.status;
                task.outputs = old.outputs;
                task.exec_count = old.exec_count;
                task.create_time = old.create_time;
                task.scheduler.status = old.scheduler.status;
            }
            self.tasks.put_task(&task).await?;
            self.cache_task(task.clone());
        }

        if task.scheduler.mode == SchedulerMode::Intime {
            for node_id in &task.nodes {
                if let Err(e) = self.put_schedul(&task.id, node_id).await {
                    warn!(task_id = %task.id, node_id = %node_id, error = %e, "Failed to schedule task");
                }
            }
        }
        Ok(task)
    }

    pub async fn update_task(&self, task: &Task) -> Result<(), SchedulingError> {
        let _guard = self.task_write.lock().await;
        self.tasks.put_task(task).await?;
        self.cache_task(task.clone());
        Ok(())
    }

    /// Read-modify-write of a task, serialized with every other task update
    pub async fn modify_task<F>(&self, task_id: &str, update: F) -> Result<Task, SchedulingError>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let _guard = self.task_write.lock().await;
        let mut task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| SchedulingError::TaskNotFound(task_id.to_string()))?;
        update(&mut task);
        self.tasks.put_task(&task).await?;
        self.cache_task(task.clone());
        Ok(task)
    }

    /// `modify_task` for paths where a vanished task is not an error
    async fn modify_task_store<F>(&self, task_id: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Task) + Send,
    {
        match self.modify_task(task_id, update).await {
            Ok(_) => Ok(()),
            Err(SchedulingError::Store(e)) => Err(e),
            Err(e) => {
                warn!(task_id, error = %e, "Task update skipped");
                Ok(())
            }
        }
    }

    /// Cached task, falling back to the store
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        if let Some(task) = self
            .task_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return Ok(Some(task.clone()));
        }
        let task = self.tasks.get_task(id).await?;
        if let Some(task) = &task {
            self.cache_task(task.clone());
        }
        Ok(task)
    }

    pub async fn get_job(&self, hash: &str) -> Result<Option<Job>, StoreError> {
        if let Some(job) = self
            .job_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
        {
            return Ok(Some(job.clone()));
        }
        self.jobs.get(hash).await
    }

    /// Remove the task's job on a node together with its execution records
    #[instrument(skip(self))]
    pub async fn stop_task(&self, task_id: &str, node_id: &str) -> Result<(), SchedulingError> {
        let hash = job_hash(task_id, node_id);
        let job = self.jobs.get(&hash).await?;
        self.jobs.delete(&hash).await?;
        self.job_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&hash);
        self.queue.done(&hash);
        if let Some(job) = job {
            let removed = self.records.delete_for_job(&job.id).await?;
            info!(job_id = %job.id, records = removed, "Task stopped on node");
        }
        Ok(())
    }

    /// Persist a group and tag its member tasks with the group id
    #[instrument(skip(self, group), fields(group_id = %group.id))]
    pub async fn update_group(&self, group: &TaskGroup) -> Result<(), SchedulingError> {
        self.tasks.put_group(group).await?;
        for task_id in &group.tasks {
            let group_id = group.id.clone();
            match self.modify_task(task_id, |t| t.group_id = group_id).await {
                Ok(_) | Err(SchedulingError::TaskNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn get_task_group(&self, id: &str) -> Result<Option<TaskGroup>, StoreError> {
        self.tasks.get_group(id).await
    }

    /// PutSchedul every member task of a group on one node
    #[instrument(skip(self))]
    pub async fn schedule_group(&self, group_id: &str, node_id: &str) -> Result<TaskGroup, SchedulingError> {
        let mut group = self
            .tasks
            .get_group(group_id)
            .await?
            .ok_or_else(|| SchedulingError::GroupNotFound(group_id.to_string()))?;

        if group.tasks.is_empty() {
            group.status = Some(TaskGroupStatus {
                status: GroupState::NotDefineTask,
                start_time: None,
                end_time: None,
            });
            self.tasks.put_group(&group).await?;
            return Ok(group);
        }

        for task_id in &group.tasks {
            if let Err(e) = self.put_schedul(task_id, node_id).await {
                warn!(group_id, task_id = %task_id, error = %e, "Failed to schedule group task");
            }
        }
        group.status = Some(TaskGroupStatus {
            status: GroupState::Start,
            start_time: Some(Utc::now()),
            end_time: None,
        });
        self.tasks.put_group(&group).await?;
        Ok(group)
    }

    /// Load task and group definitions shipped as JSON files
    ///
    /// Files whose name contains `task` hold a Task, those containing
    /// `group` hold a TaskGroup. Broken files are logged and skipped.
    #[instrument(skip(self))]
    pub async fn load_static_tasks(&self) -> usize {
        let Some(dir) = self.options.static_task_path.clone() else {
            return 0;
        };
        let files = match json_files(&dir).await {
            Ok(files) => files,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot read static task directory");
                return 0;
            }
        };

        let mut loaded = 0;
        // Tasks first so that groups can tag them
        for (name, path) in files.iter().filter(|(name, _)| !name.contains("group") && name.contains("task")) {
            match read_json::<Task>(path).await {
                Ok(task) => match self.add_task(task).await {
                    Ok(task) => {
                        debug!(task_id = %task.id, file = %name, "Static task loaded");
                        loaded += 1;
                    }
                    Err(e) => error!(file = %name, error = %e, "Failed to add static task"),
                },
                Err(e) => error!(file = %name, error = %e, "Failed to parse static task"),
            }
        }
        for (name, path) in files.iter().filter(|(name, _)| name.contains("group")) {
            match read_json::<TaskGroup>(path).await {
                Ok(mut group) => {
                    if group.id.is_empty() {
                        group.id = group.name.clone();
                    }
                    match self.update_group(&group).await {
                        Ok(()) => loaded += 1,
                        Err(e) => error!(file = %name, error = %e, "Failed to store static group"),
                    }
                }
                Err(e) => error!(file = %name, error = %e, "Failed to parse static group"),
            }
        }
        info!(loaded, "Static tasks loaded");
        loaded
    }

    fn cache_task(&self, task: Task) {
        self.task_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task);
    }

    fn cache_job(&self, job: Job) {
        self.job_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.hash.clone(), job);
    }
}

/// Whether a released job forbids creating another one for its pair
///
/// Cycle jobs never record a run status, so release alone blocks them.
/// Only-once jobs block only after a successful run.
fn blocks_rerun(existing: &Job, mode: RunMode) -> bool {
    let released = existing
        .scheduler
        .as_ref()
        .map(|s| s.scheduler_status == ScheduleState::Success)
        .unwrap_or(false);
    match mode {
        RunMode::Cycle => released,
        RunMode::OnlyOnce => {
            released
                && existing
                    .run_status
                    .as_ref()
                    .map(|r| r.status == COMPLE_SUCCESS)
                    .unwrap_or(false)
        }
        RunMode::ManyOnce => false,
    }
}

fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

async fn json_files(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        files.push((name, path));
    }
    files.sort();
    Ok(files)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::from_str(&body).map_err(|e| e.to_string())
}
