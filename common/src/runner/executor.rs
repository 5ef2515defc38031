// Local process execution of job commands

use crate::errors::ExecutionError;
use crate::job::split_command;
use crate::models::Job;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, instrument, warn};

/// Result of one attempt, as written into the execution record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutput {
    pub success: bool,
    /// Standard error on success, `<error>\n<stderr>` on failure
    pub output: String,
}

impl AttemptOutput {
    fn failed(error: &ExecutionError, stderr: &str) -> Self {
        Self {
            success: false,
            output: format!("{}\n{}", error, stderr),
        }
    }
}

/// Runs one attempt of a job
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> AttemptOutput;
}

/// Executes jobs as child processes of the runner
///
/// Standard output is treated as a log stream; standard error carries the
/// result that the reconciler later parses.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    log_dir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self { log_dir }
    }

    async fn run(&self, job: &Job) -> Result<String, (ExecutionError, String)> {
        let (program, args) =
            split_command(&job.command).ok_or((ExecutionError::EmptyCommand, String::new()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(job.envs.iter().filter_map(|env| env.split_once('=')))
            .stdin(if job.stdin.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| (ExecutionError::SpawnFailed(e), String::new()))?;
        debug!(job_id = %job.id, pid = ?child.id(), program = %program, "Process started");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = job.stdin.clone().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!(error = %e, "Failed to write job stdin");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_log(out, job.id.clone(), self.log_file(job))));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_all(err)));

        let status = if job.timeout > 0 {
            match tokio::time::timeout(Duration::from_secs(job.timeout as u64), child.wait()).await
            {
                Ok(status) => status,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job.id, error = %e, "Failed to kill timed out process");
                    }
                    let stderr = collect(stderr).await;
                    return Err((ExecutionError::Timeout(job.timeout as u64), stderr));
                }
            }
        } else {
            child.wait().await
        };

        if let Some(handle) = stdout {
            let _ = handle.await;
        }
        let stderr = collect(stderr).await;

        match status {
            Ok(status) if status.success() => Ok(stderr),
            Ok(status) => Err((ExecutionError::NonZeroExit(status.to_string()), stderr)),
            Err(e) => Err((ExecutionError::SpawnFailed(e), stderr)),
        }
    }

    fn log_file(&self, job: &Job) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", job.id)))
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    #[instrument(skip(self, job), fields(job_id = %job.id, task_id = %job.task_id))]
    async fn execute(&self, job: &Job) -> AttemptOutput {
        match self.run(job).await {
            Ok(output) => AttemptOutput {
                success: true,
                output,
            },
            Err((error, stderr)) => {
                warn!(error = %error, "Job attempt failed");
                AttemptOutput::failed(&error, &stderr)
            }
        }
    }
}

async fn forward_log(stdout: ChildStdout, job_id: String, path: Option<PathBuf>) {
    let mut file = match path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open job log file");
                None
            }
        },
        None => None,
    };

    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(job_id = %job_id, line = %line, "job output");
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(format!("{}\n", line).as_bytes()).await {
                        warn!(error = %e, "Job log write failed, disabling file sink");
                        file = None;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read job output");
                break;
            }
        }
    }
}

async fn read_all(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        warn!(error = %e, "Failed to read job stderr");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{JobKind, Rule, RunMode};
    use std::collections::HashMap;

    fn job(command: &str) -> Job {
        Job {
            id: "job-1".to_string(),
            task_id: "t1".to_string(),
            node_id: "n1".to_string(),
            hash: "h".to_string(),
            name: "t1".to_string(),
            command: command.to_string(),
            stdin: String::new(),
            envs: Vec::new(),
            rule: Rule {
                id: "r1".to_string(),
                mode: RunMode::OnlyOnce,
                timer: String::new(),
                labels: HashMap::new(),
            },
            kind: JobKind::Common,
            timeout: 0,
            retry: 0,
            interval: 0,
            avg_time: 0,
            scheduler: None,
            run_status: None,
        }
    }

    #[tokio::test]
    async fn test_success_captures_stderr_only() {
        let executor = ProcessExecutor::default();
        let out = executor.execute(&job("ls /")).await;
        assert!(out.success);
        assert_eq!(out.output, "");
    }

    #[tokio::test]
    async fn test_envs_and_stdin_reach_the_process() {
        let mut j = job("env");
        j.envs = vec!["FLEET_TEST_VAR=42".to_string()];
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(Some(dir.path().to_path_buf()));
        assert!(executor.execute(&j).await.success);
        let log = std::fs::read_to_string(dir.path().join("job-1.log")).unwrap();
        assert!(log.contains("FLEET_TEST_VAR=42"));

        let mut j = job("cat");
        j.stdin = "payload".to_string();
        assert!(executor.execute(&j).await.success);
    }

    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let mut j = job("sleep 30");
        j.timeout = 1;
        let out = ProcessExecutor::default().execute(&j).await;
        assert!(!out.success);
        assert!(out.output.starts_with("Execution timeout"), "{}", out.output);
    }

    #[tokio::test]
    async fn test_empty_and_missing_commands_fail() {
        let executor = ProcessExecutor::default();
        assert!(!executor.execute(&job("   ")).await.success);
        assert!(!executor.execute(&job("definitely-not-a-binary-xyz")).await.success);
    }
}
