//! Collaborator interfaces consumed by the dispatcher.
//!
//! The dispatcher only ever talks to the outside world through these three
//! traits. Implementations must tolerate concurrent calls from different
//! execution routines; rate limiting is their concern, not the caller's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Task, TaskId};
use crate::error::Result;

/// Final result of one execution, as reported to the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { output: String },
    Failed { error: String },
}

impl TaskOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        TaskOutcome::Succeeded {
            output: output.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    /// Output on success, error description on failure.
    pub fn message(&self) -> &str {
        match self {
            TaskOutcome::Succeeded { output } => output,
            TaskOutcome::Failed { error } => error,
        }
    }
}

/// Everything the backend needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    /// Isolated directory from the provisioner, or the process cwd.
    pub working_dir: PathBuf,
    /// Upper bound the caller will enforce regardless of the backend.
    pub timeout: Duration,
    /// Cancelled when shutdown gives up waiting on this execution.
    pub cancel: CancellationToken,
}

/// What the backend produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ExecutionOutput {
    pub fn new(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    /// Exit status zero. A missing code (killed by signal) is a failure.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn into_outcome(self) -> TaskOutcome {
        if self.is_success() {
            TaskOutcome::Succeeded {
                output: self.output,
            }
        } else {
            let status = match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            let error = if self.output.trim().is_empty() {
                status
            } else {
                format!("{}: {}", status, self.output.trim())
            };
            TaskOutcome::Failed { error }
        }
    }
}

/// Source of truth for tasks and their outcomes.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Current snapshot of tasks that might be dispatchable.
    async fn fetch_eligible_tasks(&self) -> Result<Vec<Task>>;

    /// Post the final outcome of an execution.
    async fn report_outcome(&self, task_id: &TaskId, outcome: &TaskOutcome) -> Result<()>;

    /// Flag a task as picked up. Best effort.
    async fn mark_started(&self, _task_id: &TaskId) -> Result<()> {
        Ok(())
    }

    /// Flag the orchestrator as gone. Runs as a shutdown cleanup callback.
    async fn mark_stopped(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs one unit of work.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutput>;
}

/// Hands out isolated per-task working directories.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn acquire(&self, task_id: &TaskId) -> Result<PathBuf>;

    async fn release(&self, task_id: &TaskId) -> Result<()>;
}
