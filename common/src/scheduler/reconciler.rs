// Record reconciler: folds execution records back into task state

use super::engine::TaskEngine;
use crate::errors::{RuntimeError, SchedulingError};
use crate::lock::DistributedLock;
use crate::models::{
    ConfigUnit, ExecutionRecord, JobKind, TaskOutput, TaskPhase, TaskStatus, COMPLE_FAILURE,
    COMPLE_SUCCESS,
};
use crate::repositories::ExecutionRepository;
use crate::telemetry;
use crate::watch::{Event, Watcher};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CHECK_OUTPUT: &str = "check";
const INSTALL_OUTPUT: &str = "install";

pub struct RecordReconciler {
    engine: Arc<TaskEngine>,
    records: ExecutionRepository,
    locker: Arc<dyn DistributedLock>,
    watcher: Watcher,
    lock_ttl: i64,
}

impl RecordReconciler {
    pub fn new(
        engine: Arc<TaskEngine>,
        records: ExecutionRepository,
        locker: Arc<dyn DistributedLock>,
        watcher: Watcher,
        lock_ttl: i64,
    ) -> Self {
        Self {
            engine,
            records,
            locker,
            watcher,
            lock_ttl,
        }
    }

    /// Consume the record stream until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        info!("Record reconciler started");
        self.watcher
            .consume_json::<ExecutionRecord, _, _>(
                &self.records.watch_prefix(),
                &cancel,
                |event| async move {
                    let record = match event {
                        Event::Added { value, .. } | Event::Modified { value, .. } => value,
                        _ => return,
                    };
                    if record.is_handled {
                        return;
                    }
                    if let Err(e) = self.handle(&record).await {
                        warn!(record_id = %record.id, job_id = %record.job_id, error = %e, "Failed to reconcile record");
                    }
                },
            )
            .await
    }

    /// Apply one record at most once across concurrent reconcilers
    ///
    /// Returns false when the record was skipped.
    #[instrument(skip(self, record), fields(record_id = %record.id, task_id = %record.task_id, node_id = %record.node_id))]
    pub async fn handle(&self, record: &ExecutionRecord) -> Result<bool, SchedulingError> {
        let lock_id = format!("record-{}", record.id);
        // Interval locks are never renewed nor revoked; the lease lapses on its own
        let Some(_lock) = self
            .locker
            .acquire(&lock_id, JobKind::Interval, self.lock_ttl)
            .await?
        else {
            debug!("Record is being handled elsewhere");
            return Ok(false);
        };

        let Some(mut record) = self.records.get(&record.job_id, &record.id).await? else {
            return Ok(false);
        };
        if record.is_handled {
            return Ok(false);
        }

        let output = parse_output(&record.output);
        let comple_status = comple_status(record.success, output.as_ref());
        let status = TaskStatus {
            job_id: record.job_id.clone(),
            status: TaskPhase::Complete,
            start_time: Some(record.begin_time),
            end_time: Some(record.end_time),
            take_time: record.take_time_seconds(),
            comple_status: comple_status.clone(),
            shell_code: 0,
            message: if record.success {
                String::new()
            } else {
                record.output.clone()
            },
        };

        let task_output = output.map(|mut output| {
            output.node_id = record.node_id.clone();
            output.job_id = record.job_id.clone();
            output
        });

        let node_id = record.node_id.clone();
        let stored_output = task_output.clone();
        let updated = self
            .engine
            .modify_task(&record.task_id, move |task| {
                task.update_node_status(&node_id, status);
                if let Some(output) = stored_output {
                    task.update_output(output);
                }
                task.exec_count += 1;
                task.complete_time = Some(Utc::now());
            })
            .await;

        match updated {
            Ok(task) => {
                if let Some(output) = &task_output {
                    self.apply_output(&task.group_id, &record.node_id, output)
                        .await;
                }
                info!(comple_status = %comple_status, exec_count = task.exec_count, "Task status reconciled");
            }
            Err(SchedulingError::TaskNotFound(_)) => {
                warn!("Task of record no longer exists");
            }
            Err(e) => return Err(e),
        }

        record.is_handled = true;
        self.records.update(&record).await?;
        telemetry::record_reconciled();
        Ok(true)
    }

    async fn apply_output(&self, group_id: &str, node_id: &str, output: &TaskOutput) {
        let datacenter = self.engine.datacenter();
        for (key, value) in &output.global {
            let name = key.to_uppercase();
            let unit = if value.contains(',') {
                ConfigUnit::array(
                    &name,
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            } else {
                ConfigUnit::string(&name, value)
            };
            if let Err(e) = datacenter.put_config(unit).await {
                warn!(name = %name, error = %e, "Failed to store global output");
            }
        }

        if !group_id.is_empty() {
            for (key, value) in &output.inner {
                datacenter.set_group_value(group_id, key, value);
            }
        }

        if output.output_type != CHECK_OUTPUT && output.output_type != INSTALL_OUTPUT {
            return;
        }
        for status in &output.status {
            if !status.condition_type.is_empty() {
                self.engine
                    .nodes()
                    .update_condition(node_id, &status.condition_type, &status.condition_status)
                    .await;
            }
            for task_id in &status.next_tasks {
                if let Err(e) = self.engine.put_schedul(task_id, node_id).await {
                    warn!(next_task = %task_id, error = %e, "Failed to schedule next task");
                }
            }
            for group in &status.next_groups {
                if let Err(e) = self.engine.schedule_group(group, node_id).await {
                    warn!(next_group = %group, error = %e, "Failed to schedule next group");
                }
            }
        }
    }
}

/// The first JSON object embedded in a command's output
pub fn parse_output(output: &str) -> Option<TaskOutput> {
    let start = output.find('{')?;
    let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<TaskOutput>();
    match stream.next() {
        Some(Ok(parsed)) => Some(parsed),
        Some(Err(e)) => {
            debug!(error = %e, "Record output is not a task output");
            None
        }
        None => None,
    }
}

/// Completion status of a run
pub fn comple_status(success: bool, output: Option<&TaskOutput>) -> String {
    match output {
        Some(output) if !output.exec_status.is_empty() => output.exec_status.clone(),
        Some(_) if success => COMPLE_SUCCESS.to_string(),
        _ => COMPLE_FAILURE.to_string(),
    }
}
