use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Completion status written by the reconciler for a successful run
pub const COMPLE_SUCCESS: &str = "Success";
pub const COMPLE_FAILURE: &str = "Failure";

// ============================================================================
// Enumerations
// ============================================================================

/// How often a task may run on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    OnlyOnce,
    ManyOnce,
    Cycle,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::OnlyOnce => "onlyonce",
            RunMode::ManyOnce => "manyonce",
            RunMode::Cycle => "cycle",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a task is scheduled as soon as it is added or only on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    Intime,
    #[default]
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    AtLeastOnce,
    SameNode,
}

/// Cluster-exclusivity of a job's executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Common,
    /// Lock kept alive for the whole run
    Alone,
    /// Lock left to expire on its own
    Interval,
}

/// Outcome of the validation pipeline for one (task, node) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    Waiting,
    Success,
    Failure,
    Timeout,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleState::Waiting => "Waiting",
            ScheduleState::Success => "Success",
            ScheduleState::Failure => "Failure",
            ScheduleState::Timeout => "Timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Create,
    Start,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Start,
    NotDefineTask,
}

// ============================================================================
// Task Models
// ============================================================================

/// Operator-defined unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub temp: Option<TaskTemplate>,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub timer: String,
    /// Seconds a job may wait on its dependencies, 0 for no limit
    #[serde(default)]
    pub time_out: i64,
    #[serde(default)]
    pub retry: i32,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub exec_count: u64,
    #[serde(default)]
    pub status: HashMap<String, TaskStatus>,
    #[serde(default)]
    pub scheduler: TaskScheduler,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub complete_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, template: TaskTemplate) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            group_id: String::new(),
            temp: Some(template),
            nodes: Vec::new(),
            run_mode: RunMode::default(),
            timer: String::new(),
            time_out: 0,
            retry: 0,
            interval: 0,
            kind: JobKind::default(),
            exec_count: 0,
            status: HashMap::new(),
            scheduler: TaskScheduler::default(),
            outputs: Vec::new(),
            create_time: Utc::now(),
            start_time: None,
            complete_time: None,
        }
    }

    /// Completion status recorded for a node, empty when none
    pub fn comple_status(&self, node_id: &str) -> &str {
        self.status
            .get(node_id)
            .map(|s| s.comple_status.as_str())
            .unwrap_or("")
    }

    pub fn has_succeeded_on(&self, node_id: &str) -> bool {
        self.comple_status(node_id) == COMPLE_SUCCESS
    }

    pub fn update_node_status(&mut self, node_id: &str, status: TaskStatus) {
        self.status.insert(node_id.to_string(), status);
    }

    pub fn update_scheduler_status(&mut self, node_id: &str, status: SchedulerStatus) {
        self.scheduler.status.insert(node_id.to_string(), status);
    }

    /// Replace the output previously reported by the same node
    pub fn update_output(&mut self, output: TaskOutput) {
        self.outputs.retain(|o| o.node_id != output.node_id);
        self.outputs.push(output);
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.temp
            .as_ref()
            .map(|t| t.labels.clone())
            .unwrap_or_default()
    }
}

/// Command and environment shared by every Job of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub shell: Shell,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub depends: Vec<DependStrategy>,
    /// Seconds one execution attempt may take, 0 for no limit
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Shell {
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependStrategy {
    pub depend_task_id: String,
    pub strategy: Strategy,
}

/// Execution state of a task on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub job_id: String,
    pub status: TaskPhase,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default)]
    pub take_time: i64,
    #[serde(default)]
    pub comple_status: String,
    #[serde(default)]
    pub shell_code: i32,
    #[serde(default)]
    pub message: String,
}

impl TaskStatus {
    pub fn started(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: TaskPhase::Start,
            start_time: Some(Utc::now()),
            end_time: None,
            take_time: 0,
            comple_status: String::new(),
            shell_code: 0,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: String::new(),
            status: TaskPhase::Complete,
            start_time: Some(now),
            end_time: Some(now),
            take_time: 0,
            comple_status: COMPLE_FAILURE.to_string(),
            shell_code: 0,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskScheduler {
    #[serde(default)]
    pub mode: SchedulerMode,
    #[serde(default)]
    pub status: HashMap<String, SchedulerStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub status: ScheduleState,
    #[serde(default)]
    pub message: String,
    pub scheduler_time: DateTime<Utc>,
    #[serde(default)]
    pub scheduler_master: String,
}

impl SchedulerStatus {
    pub fn new(status: ScheduleState, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            scheduler_time: Utc::now(),
            scheduler_master: String::new(),
        }
    }
}

/// Structured payload a job prints to share configuration and cascade work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskOutput {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub global: HashMap<String, String>,
    #[serde(default)]
    pub inner: HashMap<String, String>,
    #[serde(default, rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub status: Vec<OutputStatus>,
    #[serde(default)]
    pub exec_status: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutputStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub condition_type: String,
    #[serde(default)]
    pub condition_status: String,
    #[serde(default)]
    pub next_tasks: Vec<String>,
    #[serde(default)]
    pub next_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Member task ids
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<TaskGroupStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupStatus {
    pub status: GroupState,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Job Models
// ============================================================================

/// One (task, node) scheduling instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task_id: String,
    pub node_id: String,
    pub hash: String,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub stdin: String,
    /// `KEY=VALUE` pairs appended to the process environment
    #[serde(default)]
    pub envs: Vec<String>,
    pub rule: Rule,
    #[serde(default)]
    pub kind: JobKind,
    /// Seconds one attempt may take, 0 for no limit
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub retry: i32,
    /// Seconds between attempts
    #[serde(default)]
    pub interval: i64,
    /// Running average of execution time in milliseconds
    #[serde(default)]
    pub avg_time: i64,
    #[serde(default)]
    pub scheduler: Option<JobScheduler>,
    #[serde(default)]
    pub run_status: Option<RunStatus>,
}

/// Timing policy of a Job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub mode: RunMode,
    #[serde(default)]
    pub timer: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Scheduling decision attached to a Job by the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobScheduler {
    pub node_id: String,
    pub scheduler_time: DateTime<Utc>,
    pub can_run: bool,
    #[serde(default)]
    pub message: String,
    pub scheduler_status: ScheduleState,
    /// First time the job was deferred, kept across retries
    #[serde(default)]
    pub waiting_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub record_id: String,
}

// ============================================================================
// Execution Models
// ============================================================================

/// Immutable log of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub job_id: String,
    pub task_id: String,
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub output: String,
    pub success: bool,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Set once by the reconciler
    #[serde(default)]
    pub is_handled: bool,
}

impl ExecutionRecord {
    pub fn take_time_seconds(&self) -> i64 {
        (self.end_time - self.begin_time).num_seconds().max(0)
    }
}

// ============================================================================
// Cluster Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNode {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Condition type to status, reported by check/install jobs
    #[serde(default)]
    pub conditions: HashMap<String, String>,
}

impl HostNode {
    /// Whether every selector label is present with the same value
    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|own| own == v).unwrap_or(false))
    }
}

/// Cluster-wide configuration value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Array(Vec<String>),
}

impl ConfigValue {
    /// Rendering used for `${KEY}` substitution
    pub fn render(&self) -> String {
        match self {
            ConfigValue::String(s) => s.clone(),
            ConfigValue::Array(values) => values.join(","),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUnit {
    pub name: String,
    pub value: ConfigValue,
    #[serde(default)]
    pub value_type: String,
    #[serde(default)]
    pub is_configurable: bool,
}

impl ConfigUnit {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ConfigValue::String(value.into()),
            value_type: "string".to_string(),
            is_configurable: false,
        }
    }

    pub fn array(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            value: ConfigValue::Array(values),
            value_type: "array".to_string(),
            is_configurable: false,
        }
    }
}
