// Error handling framework

use thiserror::Error;

/// Consistency store errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Required revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error signals that the requested history is gone
    pub fn is_compacted(&self) -> bool {
        matches!(self, StoreError::Compacted { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Rule and timer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid timer expression '{expression}': {reason}")]
    InvalidTimer { expression: String, reason: String },

    #[error("job rule mode({0}) timer can not be empty")]
    MissingTimer(String),

    #[error("job rule mode({0}) does not accept a timer")]
    UnexpectedTimer(String),

    #[error("No next fire time available for timer '{0}'")]
    NoNextFire(String),
}

/// Errors raised while creating or validating scheduling decisions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("taskid or nodeid can not be empty")]
    EmptyIdentity,

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("task group {0} not found")]
    GroupNotFound(String),

    #[error("task temp can not be nil")]
    MissingTemplate,

    #[error("task {task_id} run on node {node_id} job only run mode {mode}")]
    RunModeViolation {
        task_id: String,
        node_id: String,
        mode: String,
    },

    #[error("create job error,{0}")]
    InvalidRule(#[from] ScheduleError),

    #[error("task {task_id} only run once and has completed on node {node_id}")]
    AlreadyCompleted { task_id: String, node_id: String },

    #[error("depend task {0} is not found")]
    DependencyNotFound(String),

    #[error("depend task {task_id} run failure on node {node_id}: {status}")]
    DependencyFailed {
        task_id: String,
        node_id: String,
        status: String,
    },

    #[error("depend task {0} can not found exec node")]
    NoExecutionNode(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Command execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Job command is empty")]
    EmptyCommand,

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("exit status {0}")]
    NonZeroExit(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),
}

/// Variable substitution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubstitutionError {
    #[error("{variables:?} Parameter not specified in '{template}'")]
    UndefinedVariable {
        variables: Vec<String>,
        template: String,
    },

    #[error("Regex compilation error: {0}")]
    RegexError(String),
}

/// Scheduler queue errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Scheduler queue cancelled")]
    Cancelled,

    #[error("Scheduler queue closed")]
    Closed,
}

/// Leader election errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElectionError {
    #[error("Master lock lost: {0}")]
    LeadershipLost(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Fatal errors forwarded from long-running loops to their owner
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Watch on '{key}' failed: {message}")]
    Watch { key: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Leader election error: {0}")]
    Election(#[from] ElectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] SubstitutionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_violation_message() {
        let err = SchedulingError::RunModeViolation {
            task_id: "cleanup".to_string(),
            node_id: "n1".to_string(),
            mode: "cycle".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "task cleanup run on node n1 job only run mode cycle"
        );
        assert!(err.to_string().contains("only run mode"));
    }

    #[test]
    fn test_dependency_errors_display() {
        assert_eq!(
            SchedulingError::DependencyNotFound("init".to_string()).to_string(),
            "depend task init is not found"
        );
        assert!(SchedulingError::NoExecutionNode("init".to_string())
            .to_string()
            .contains("can not found exec node"));
    }

    #[test]
    fn test_compacted_is_distinguishable() {
        let err = StoreError::Compacted {
            requested: 3,
            compacted: 10,
        };
        assert!(err.is_compacted());
        assert!(!StoreError::Backend("boom".to_string()).is_compacted());
    }

    #[test]
    fn test_store_error_from_serde() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_substitution_error_lists_variables() {
        let err = SubstitutionError::UndefinedVariable {
            variables: vec!["HOST".to_string()],
            template: "ping ${HOST}".to_string(),
        };
        assert!(err.to_string().contains("HOST"));
    }
}
