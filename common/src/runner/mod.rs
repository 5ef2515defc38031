// Node task runner: executes the jobs the master released for this node

pub mod cron;
pub mod executor;

use crate::errors::{RuntimeError, StoreError};
use crate::lock::StoreLocker;
use crate::models::{ExecutionRecord, Job, JobKind, RunMode, RunStatus, COMPLE_FAILURE, COMPLE_SUCCESS};
use crate::repositories::{ExecutionRepository, JobRepository};
use crate::telemetry;
use crate::watch::{Event, Watcher};
use chrono::Utc;
use self::cron::{CronTable, Upsert};
use self::executor::CommandExecutor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use self::executor::{AttemptOutput, ProcessExecutor};

/// Runs one occurrence of a job and reports it
pub struct JobRunner {
    jobs: JobRepository,
    records: ExecutionRepository,
    locker: StoreLocker,
    executor: Arc<dyn CommandExecutor>,
}

impl JobRunner {
    pub fn new(
        jobs: JobRepository,
        records: ExecutionRepository,
        locker: StoreLocker,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            jobs,
            records,
            locker,
            executor,
        }
    }

    /// Lock, attempt up to `retry` times, record every attempt
    ///
    /// Returns false when the occurrence was skipped because another node
    /// holds its lock.
    #[instrument(skip(self, job), fields(job_id = %job.id, task_id = %job.task_id, node_id = %job.node_id))]
    pub async fn run_occurrence(&self, job: Job) -> bool {
        let lock = if job.kind == JobKind::Common {
            None
        } else {
            match self.locker.lock_job(&job).await {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    telemetry::record_lock_contention();
                    debug!("Occurrence locked elsewhere, skipping");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "Lock acquisition failed, skipping occurrence");
                    return false;
                }
            }
        };

        let attempts = if job.retry <= 0 { 1 } else { job.retry };
        let mut elapsed = Vec::new();
        let mut last: Option<ExecutionRecord> = None;
        for attempt in 1..=attempts {
            let begin = Utc::now();
            let started = Instant::now();
            let outcome = self.executor.execute(&job).await;
            let took = started.elapsed();
            elapsed.push(took.as_millis() as i64);
            telemetry::record_job_execution(outcome.success, took.as_secs_f64());

            let record = ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                task_id: job.task_id.clone(),
                node_id: job.node_id.clone(),
                name: job.name.clone(),
                command: job.command.clone(),
                output: outcome.output,
                success: outcome.success,
                begin_time: begin,
                end_time: Utc::now(),
                is_handled: false,
            };
            if let Err(e) = self.records.create(&record).await {
                error!(record_id = %record.id, error = %e, "Failed to write execution record");
            }
            let success = record.success;
            last = Some(record);

            if success {
                break;
            }
            if attempt < attempts {
                warn!(attempt, attempts, "Job attempt failed, will retry");
                if job.interval > 0 {
                    tokio::time::sleep(Duration::from_secs(job.interval as u64)).await;
                }
            }
        }

        if let Some(record) = last {
            if let Err(e) = self.finish(&job, &elapsed, &record).await {
                warn!(error = %e, "Failed to persist job run status");
            }
        }
        if let Some(lock) = lock {
            if let Err(e) = lock.unlock().await {
                warn!(error = %e, "Failed to release job lock");
            }
        }
        true
    }

    /// Fold timings into the stored job and stamp its run status
    ///
    /// Cycle jobs keep no run status so that they stay eligible after a
    /// runner restart.
    async fn finish(
        &self,
        job: &Job,
        elapsed: &[i64],
        record: &ExecutionRecord,
    ) -> Result<(), StoreError> {
        let Some(mut stored) = self.jobs.get(&job.hash).await? else {
            debug!("Job deleted while running");
            return Ok(());
        };
        if stored.id != job.id {
            debug!("Job replaced while running");
            return Ok(());
        }
        for ms in elapsed {
            stored.update_avg_time(*ms);
        }
        if job.rule.mode != RunMode::Cycle {
            stored.run_status = Some(RunStatus {
                status: if record.success {
                    COMPLE_SUCCESS.to_string()
                } else {
                    COMPLE_FAILURE.to_string()
                },
                start_time: record.begin_time,
                end_time: Some(record.end_time),
                record_id: record.id.clone(),
            });
        }
        self.jobs.put(&stored).await?;
        Ok(())
    }
}

#[derive(Default)]
struct RunnerState {
    /// Cycle jobs registered in the cron table, by hash
    cycle_jobs: HashMap<String, Job>,
    /// Once-jobs started by this process and not finished yet: hash to job id
    launched: HashMap<String, String>,
}

/// Per-node consumer of the job stream
pub struct NodeTaskRunner {
    node_id: String,
    runner: Arc<JobRunner>,
    watcher: Watcher,
    jobs_prefix: String,
    cron: Mutex<CronTable>,
    state: Mutex<RunnerState>,
    cron_cancel: CancellationToken,
}

impl NodeTaskRunner {
    pub fn new(
        node_id: impl Into<String>,
        runner: Arc<JobRunner>,
        watcher: Watcher,
        jobs_prefix: impl Into<String>,
    ) -> Self {
        let cron_cancel = CancellationToken::new();
        Self {
            node_id: node_id.into(),
            runner,
            watcher,
            jobs_prefix: jobs_prefix.into(),
            cron: Mutex::new(CronTable::new(cron_cancel.clone())),
            state: Mutex::new(RunnerState::default()),
            cron_cancel,
        }
    }

    /// Follow the job stream until cancelled
    ///
    /// Stopping halts the cron table; executions already in flight finish
    /// and still write their records.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        info!(node_id = %self.node_id, "Node task runner started");
        let result = self
            .watcher
            .consume_json::<Job, _, _>(&self.jobs_prefix, &cancel, |event| {
                self.apply(event);
                std::future::ready(())
            })
            .await;
        self.cron_cancel.cancel();
        info!(node_id = %self.node_id, "Node task runner stopped");
        result
    }

    pub fn scheduled_entries(&self) -> usize {
        self.cron.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_scheduled(&self, entry_id: &str) -> bool {
        self.cron
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entry_id)
    }

    fn apply(&self, event: Event<Job>) {
        match event {
            Event::Added { value, .. } | Event::Modified { value, .. } => self.on_job(value),
            Event::Deleted { key, .. } => {
                let hash = key.rsplit('/').next().unwrap_or(&key).to_string();
                self.on_delete(&hash);
            }
            Event::Error(_) => {}
        }
    }

    /// Once-jobs launched here whose run status has not been seen yet
    pub fn launched_jobs(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .launched
            .len()
    }

    fn on_job(&self, job: Job) {
        if job.run_status.is_some() {
            self.forget_launch(&job.hash, Some(&job.id));
        }
        // Jobs that are not runnable here are ignored, not unregistered
        if !job.is_run_on(&self.node_id) {
            return;
        }

        if job.rule.mode != RunMode::Cycle {
            self.launch_once(job);
            return;
        }

        let timer = match job.rule.compiled_timer() {
            Ok(Some(timer)) => timer,
            Ok(None) => {
                warn!(job_id = %job.id, "Cycle job without timer");
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Cycle job has an invalid timer");
                return;
            }
        };

        let previous = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cycle_jobs
            .insert(job.hash.clone(), job.clone());

        let mut cron = self.cron.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = previous {
            // A new job id under the same hash replaces the entry
            if previous.entry_id() != job.entry_id() {
                cron.remove(&previous.entry_id());
            }
        }
        let runner = self.runner.clone();
        let outcome = cron.upsert(job.clone(), timer, move |job| {
            let runner = runner.clone();
            async move {
                runner.run_occurrence(job).await;
            }
        });
        if outcome != Upsert::Updated {
            debug!(job_id = %job.id, outcome = ?outcome, "Cycle job scheduled");
        }
    }

    fn on_delete(&self, hash: &str) {
        self.forget_launch(hash, None);
        let removed = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cycle_jobs
            .remove(hash);
        if let Some(job) = removed {
            self.cron
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job.entry_id());
        }
    }

    fn forget_launch(&self, hash: &str, job_id: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = match (state.launched.get(hash), job_id) {
            (Some(_), None) => true,
            (Some(launched), Some(id)) => launched == id,
            (None, _) => false,
        };
        if matches {
            state.launched.remove(hash);
        }
    }

    fn launch_once(&self, job: Job) {
        let previous = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .launched
            .insert(job.hash.clone(), job.id.clone());
        if previous.as_deref() == Some(job.id.as_str()) {
            debug!(job_id = %job.id, "Once job already launched");
            return;
        }

        info!(job_id = %job.id, task_id = %job.task_id, "Launching job");
        let runner = self.runner.clone();
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move { runner.run_occurrence(job).await });
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(job_id = %job_id, "Job execution panicked");
                }
            }
        });
    }
}
