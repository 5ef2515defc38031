// Job identity and derivation from tasks

use crate::errors::SchedulingError;
use crate::models::{Job, Rule, Task};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identity of "this task on this node": lowercase hex SHA-256 of the pair
pub fn job_hash(task_id: &str, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build an unscheduled Job for `node_id` from the task's template
pub fn create_job_from_task(task: &Task, node_id: &str) -> Result<Job, SchedulingError> {
    let temp = task.temp.as_ref().ok_or(SchedulingError::MissingTemplate)?;

    let rule = Rule {
        id: Uuid::new_v4().to_string(),
        mode: task.run_mode,
        timer: task.timer.clone(),
        labels: temp.labels.clone(),
    };
    rule.valid()?;

    let mut envs: Vec<String> = temp
        .envs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    envs.sort();

    Ok(Job {
        id: Uuid::new_v4().to_string(),
        task_id: task.id.clone(),
        node_id: node_id.to_string(),
        hash: job_hash(&task.id, node_id),
        name: task.name.clone(),
        command: temp.shell.cmd.join(" "),
        stdin: temp.input.clone(),
        envs,
        rule,
        kind: task.kind,
        timeout: temp.timeout,
        retry: task.retry,
        interval: task.interval,
        avg_time: 0,
        scheduler: None,
        run_status: None,
    })
}

impl Job {
    /// Runnable on `node_id` and not started yet
    pub fn is_run_on(&self, node_id: &str) -> bool {
        match &self.scheduler {
            Some(scheduler) => {
                scheduler.node_id == node_id && scheduler.can_run && self.run_status.is_none()
            }
            None => false,
        }
    }

    /// Not yet cleared by the validation pipeline
    pub fn awaiting_validation(&self) -> bool {
        match &self.scheduler {
            None => true,
            Some(scheduler) => {
                !scheduler.can_run
                    && scheduler.scheduler_status == crate::models::ScheduleState::Waiting
            }
        }
    }

    /// Fold one run's duration into the running average
    pub fn update_avg_time(&mut self, elapsed_ms: i64) {
        let elapsed_ms = elapsed_ms.max(0);
        if self.avg_time == 0 {
            self.avg_time = elapsed_ms;
        } else {
            self.avg_time = (self.avg_time + elapsed_ms) / 2;
        }
    }

    /// Cron-table key of a cycle job
    pub fn entry_id(&self) -> String {
        format!("{}{}", self.id, self.rule.id)
    }
}

/// Program and arguments of a command line
///
/// Splitting happens on whitespace only: quoting is not interpreted, so an
/// argument containing spaces cannot be expressed.
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        JobKind, JobScheduler, RunMode, RunStatus, ScheduleState, Shell, TaskTemplate,
    };
    use chrono::Utc;
    use std::collections::HashMap;

    fn template() -> TaskTemplate {
        TaskTemplate {
            shell: Shell {
                cmd: vec!["echo".to_string(), "${HOST}".to_string()],
            },
            envs: HashMap::from([("MODE".to_string(), "fast".to_string())]),
            input: "payload".to_string(),
            timeout: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = job_hash("t1", "n1");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, job_hash("t1", "n1"));
        assert_ne!(hash, job_hash("t1", "n2"));
    }

    #[test]
    fn test_create_job_copies_template() {
        let mut task = Task::new("t1", template());
        task.retry = 3;
        task.interval = 2;
        task.kind = JobKind::Alone;
        task.run_mode = RunMode::Cycle;
        task.timer = "@every 10s".to_string();

        let job = create_job_from_task(&task, "n1").unwrap();
        assert_eq!(job.command, "echo ${HOST}");
        assert_eq!(job.stdin, "payload");
        assert_eq!(job.envs, vec!["MODE=fast".to_string()]);
        assert_eq!(job.timeout, 30);
        assert_eq!(job.retry, 3);
        assert_eq!(job.interval, 2);
        assert_eq!(job.kind, JobKind::Alone);
        assert_eq!(job.rule.mode, RunMode::Cycle);
        assert_eq!(job.hash, job_hash("t1", "n1"));
        assert!(job.scheduler.is_none());
    }

    #[test]
    fn test_create_job_requires_template() {
        let mut task = Task::new("t1", template());
        task.temp = None;
        assert_eq!(
            create_job_from_task(&task, "n1").unwrap_err(),
            SchedulingError::MissingTemplate
        );
    }

    #[test]
    fn test_create_job_rejects_cycle_without_timer() {
        let mut task = Task::new("t1", template());
        task.run_mode = RunMode::Cycle;
        let err = create_job_from_task(&task, "n1").unwrap_err();
        assert!(matches!(err, SchedulingError::InvalidRule(_)));
        assert!(err.to_string().starts_with("create job error,"));
    }

    #[test]
    fn test_is_run_on() {
        let mut job = create_job_from_task(&Task::new("t1", template()), "n1").unwrap();
        assert!(!job.is_run_on("n1"));
        assert!(job.awaiting_validation());

        job.scheduler = Some(JobScheduler {
            node_id: "n1".to_string(),
            scheduler_time: Utc::now(),
            can_run: true,
            message: String::new(),
            scheduler_status: ScheduleState::Success,
            waiting_since: None,
        });
        assert!(job.is_run_on("n1"));
        assert!(!job.is_run_on("n2"));
        assert!(!job.awaiting_validation());

        job.run_status = Some(RunStatus {
            status: "complete".to_string(),
            start_time: Utc::now(),
            end_time: None,
            record_id: String::new(),
        });
        assert!(!job.is_run_on("n1"));
    }

    #[test]
    fn test_avg_time_update() {
        let mut job = create_job_from_task(&Task::new("t1", template()), "n1").unwrap();
        job.update_avg_time(100);
        assert_eq!(job.avg_time, 100);
        job.update_avg_time(300);
        assert_eq!(job.avg_time, 200);
        job.update_avg_time(-5);
        assert_eq!(job.avg_time, 100);
    }

    #[test]
    fn test_split_command_on_whitespace_only() {
        let (program, args) = split_command("echo  hello   world").unwrap();
        assert_eq!(program, "echo");
        assert_eq!(args, vec!["hello", "world"]);

        // Quotes are not interpreted: the quoted argument is split in two
        let (_, args) = split_command("sh -c \"echo hi\"").unwrap();
        assert_eq!(args, vec!["-c", "\"echo", "hi\""]);

        assert!(split_command("   ").is_none());
    }
}
