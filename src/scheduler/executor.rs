//! Job execution in isolated subprocesses.
//!
//! Every job runs in its own OS process so that a crash in arbitrary job
//! logic cannot take the worker down with it. The process's exit code is
//! the outcome (0 = success) and its standard error is captured in full for
//! failure classification.
//!
//! # Contract
//!
//! For a job `{"class": "reports/daily", "args": ["2024-01-01", 7]}` and a
//! scripts root `/srv/scripts`, the executor runs:
//!
//! ```text
//! cwd=/srv/scripts RESQUE_SCRIPTS_ROOT=/srv/scripts RESQUE_JOB='{...}' \
//!     /srv/scripts/reports/daily 2024-01-01 7
//! ```
//!
//! String arguments are passed verbatim; every other JSON value is passed as
//! its compact JSON text.
//!
//! Jobs run without a timeout: a hung job occupies its worker slot until it
//! exits.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::job::Job;

/// Environment variable holding the scripts root for the job process.
pub const SCRIPTS_ROOT_ENV: &str = "RESQUE_SCRIPTS_ROOT";

/// Environment variable holding the full job payload for the job process.
pub const JOB_PAYLOAD_ENV: &str = "RESQUE_JOB";

/// Errors that prevent a job process from running to completion.
///
/// These are still attributable to the job: the worker records them as
/// failures named after the variant.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The job's class cannot name a file under the scripts root.
    #[error("Invalid job target '{0}'")]
    InvalidTarget(String),

    /// No executable exists for the job's class.
    #[error("No script for '{target}' at {}", .path.display())]
    ScriptNotFound { target: String, path: PathBuf },

    /// The process could not be started.
    #[error("Failed to spawn {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the process failed.
    #[error("Failed to wait for job process: {0}")]
    WaitFailed(#[source] std::io::Error),

    /// The payload could not be serialized for the job process.
    #[error("Failed to serialize job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ExecutorError {
    /// Exception name recorded in the failure record.
    pub fn exception_name(&self) -> &'static str {
        match self {
            ExecutorError::InvalidTarget(_) => "InvalidTarget",
            ExecutorError::ScriptNotFound { .. } => "ScriptNotFound",
            ExecutorError::SpawnFailed { .. } => "SpawnFailed",
            ExecutorError::WaitFailed(_) => "WaitFailed",
            ExecutorError::Payload(_) => "InvalidPayload",
        }
    }
}

/// Outcome of one job process.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Everything the process wrote to standard error.
    pub diagnostics: String,
    /// Wall-clock duration of the process.
    pub duration: Duration,
}

impl ExecutionOutput {
    pub fn new(exit_code: Option<i32>, diagnostics: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code,
            diagnostics: diagnostics.into(),
            duration,
        }
    }

    /// Checks if the job completed successfully (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a job and reports how it ended.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<ExecutionOutput, ExecutorError>;
}

/// Executes jobs as executables under a scripts root.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    scripts_root: PathBuf,
}

impl ScriptExecutor {
    pub fn new(scripts_root: impl Into<PathBuf>) -> Self {
        Self {
            scripts_root: scripts_root.into(),
        }
    }

    pub fn scripts_root(&self) -> &Path {
        &self.scripts_root
    }

    /// Maps a job class to a path under the scripts root.
    ///
    /// Classes may contain `/` to reach nested scripts but can never leave
    /// the root.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, ExecutorError> {
        let relative = Path::new(target);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));

        if target.is_empty() || escapes {
            return Err(ExecutorError::InvalidTarget(target.to_string()));
        }

        let path = self.scripts_root.join(relative);
        if !path.is_file() {
            return Err(ExecutorError::ScriptNotFound {
                target: target.to_string(),
                path,
            });
        }

        Ok(path)
    }
}

/// Renders a job argument as a process argument.
pub fn argument_text(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl JobExecutor for ScriptExecutor {
    async fn execute(&self, job: &Job) -> Result<ExecutionOutput, ExecutorError> {
        let path = self.resolve(&job.target)?;
        let payload = job.to_payload()?;
        let start = Instant::now();

        let mut cmd = Command::new(&path);
        cmd.args(job.args.iter().map(argument_text))
            .current_dir(&self.scripts_root)
            .env(SCRIPTS_ROOT_ENV, &self.scripts_root)
            .env(JOB_PAYLOAD_ENV, &payload)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());

        debug!(script = %path.display(), "Spawning job process");

        let child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            path: path.clone(),
            source,
        })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(ExecutorError::WaitFailed)?;

        let mut diagnostics = String::from_utf8_lossy(&output.stderr).to_string();
        if diagnostics.trim().is_empty() {
            if let Some(description) = termination_signal(&output.status) {
                diagnostics = description;
            }
        }

        debug!(
            script = %path.display(),
            exit_code = ?output.status.code(),
            "Job process exited"
        );

        Ok(ExecutionOutput::new(
            output.status.code(),
            diagnostics,
            start.elapsed(),
        ))
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| format!("job process terminated by signal {}", signal))
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<String> {
    None
}
