// Validation criteria applied to a job before it may run

use super::engine::TaskEngine;
use crate::errors::SchedulingError;
use crate::models::{Job, RunMode, SchedulerMode, Strategy, Task, COMPLE_SUCCESS};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Verdict of a criterion that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not yet; the job is retried later
    Waiting(String),
}

/// One gate of the validation pipeline
///
/// An `Err` is a permanent failure for this job.
#[async_trait]
pub trait Criterion: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        engine: &TaskEngine,
        task: &Task,
        job: &Job,
    ) -> Result<Readiness, SchedulingError>;
}

/// The pipeline in its fixed order
pub fn default_criteria() -> Vec<Box<dyn Criterion>> {
    vec![Box::new(ModeRun), Box::new(DependsRun)]
}

/// OnlyOnce tasks never run twice successfully on one node
pub struct ModeRun;

#[async_trait]
impl Criterion for ModeRun {
    fn name(&self) -> &'static str {
        "mode_run"
    }

    async fn check(
        &self,
        _engine: &TaskEngine,
        task: &Task,
        job: &Job,
    ) -> Result<Readiness, SchedulingError> {
        if task.run_mode == RunMode::OnlyOnce && task.has_succeeded_on(&job.node_id) {
            return Err(SchedulingError::AlreadyCompleted {
                task_id: task.id.clone(),
                node_id: job.node_id.clone(),
            });
        }
        Ok(Readiness::Ready)
    }
}

/// Dependency gating per the template's strategies
pub struct DependsRun;

#[async_trait]
impl Criterion for DependsRun {
    fn name(&self) -> &'static str {
        "depends_run"
    }

    async fn check(
        &self,
        engine: &TaskEngine,
        task: &Task,
        job: &Job,
    ) -> Result<Readiness, SchedulingError> {
        let Some(temp) = task.temp.as_ref() else {
            return Err(SchedulingError::MissingTemplate);
        };

        for depend in &temp.depends {
            let dep = engine
                .get_task(&depend.depend_task_id)
                .await?
                .ok_or_else(|| SchedulingError::DependencyNotFound(depend.depend_task_id.clone()))?;

            let readiness = match depend.strategy {
                Strategy::AtLeastOnce => at_least_once(engine, &dep).await?,
                Strategy::SameNode => same_node(engine, &dep, &job.node_id).await?,
            };
            if let Readiness::Waiting(reason) = readiness {
                debug!(task_id = %task.id, depend = %dep.id, reason = %reason, "Dependency not ready");
                return Ok(Readiness::Waiting(reason));
            }
        }
        Ok(Readiness::Ready)
    }
}

async fn at_least_once(engine: &TaskEngine, dep: &Task) -> Result<Readiness, SchedulingError> {
    if dep
        .status
        .values()
        .any(|status| status.comple_status == COMPLE_SUCCESS)
    {
        return Ok(Readiness::Ready);
    }

    if dep.scheduler.mode == SchedulerMode::Passive && dep.scheduler.status.is_empty() {
        let node = engine
            .nodes()
            .nodes_with_labels(&dep.labels())
            .await
            .into_iter()
            .next()
            .ok_or_else(|| SchedulingError::NoExecutionNode(dep.id.clone()))?;
        cascade(engine, &dep.id, &node.id).await;
    }
    Ok(Readiness::Waiting(format!("depend task {} is not complete", dep.id)))
}

async fn same_node(
    engine: &TaskEngine,
    dep: &Task,
    node_id: &str,
) -> Result<Readiness, SchedulingError> {
    match dep.comple_status(node_id) {
        COMPLE_SUCCESS => Ok(Readiness::Ready),
        "" => {
            if dep.scheduler.mode == SchedulerMode::Passive
                && !dep.scheduler.status.contains_key(node_id)
            {
                cascade(engine, &dep.id, node_id).await;
            }
            Ok(Readiness::Waiting(format!(
                "depend task {} is not complete on node {}",
                dep.id, node_id
            )))
        }
        other => Err(SchedulingError::DependencyFailed {
            task_id: dep.id.clone(),
            node_id: node_id.to_string(),
            status: other.to_string(),
        }),
    }
}

/// Schedule a passive dependency on behalf of its dependent
async fn cascade(engine: &TaskEngine, task_id: &str, node_id: &str) {
    match engine.put_schedul(task_id, node_id).await {
        Ok(_) => debug!(task_id, node_id, "Dependency scheduled"),
        Err(e) => warn!(task_id, node_id, error = %e, "Failed to schedule dependency"),
    }
}
