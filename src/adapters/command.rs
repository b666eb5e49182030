//! Execution backend that runs a configured command per task.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::backend::{ExecutionBackend, ExecutionOutput, ExecutionRequest};
use crate::orchestration::shutdown::{send_signal, ShutdownCoordinator, TrackId};

/// Environment variable carrying the task id.
pub const TASK_ID_ENV: &str = "CONDUCTOR_TASK_ID";

/// Environment variable carrying the task name.
pub const TASK_NAME_ENV: &str = "CONDUCTOR_TASK_NAME";

/// Runs `program args...` in the task's working directory.
///
/// Arguments may contain `{id}`, `{name}` and `{description}`; an empty
/// description is replaced by the name.
#[derive(Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    coordinator: Option<ShutdownCoordinator>,
    kill_grace: Duration,
}

impl CommandBackend {
    /// Build from an argv, resolving the program on `PATH`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `command` is empty
    /// - [`Error::CommandNotFound`] if the program cannot be resolved
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("backend command is empty".to_string()))?;
        let resolved =
            which::which(program).map_err(|_| Error::CommandNotFound(program.clone()))?;
        Ok(Self {
            program: resolved,
            args: args.to_vec(),
            coordinator: None,
            kill_grace: Duration::from_secs(crate::orchestration::shutdown::DEFAULT_KILL_GRACE_SECS),
        })
    }

    /// Track every child with `coordinator`, using its kill grace period.
    pub fn with_coordinator(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.kill_grace = coordinator.config().kill_grace;
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments with placeholders filled in for `task`.
    pub fn render_args(&self, task: &Task) -> Vec<String> {
        let description = if task.description.trim().is_empty() {
            task.name.as_str()
        } else {
            task.description.as_str()
        };
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{id}", task.id.as_str())
                    .replace("{name}", &task.name)
                    .replace("{description}", description)
            })
            .collect()
    }
}

/// Untracks the child pid however `run` exits.
struct ProcessTracking {
    coordinator: ShutdownCoordinator,
    id: TrackId,
}

impl Drop for ProcessTracking {
    fn drop(&mut self) {
        self.coordinator.untrack_process(self.id);
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&stderr);
    }
    output
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        let task = &request.task;
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(task))
            .current_dir(&request.working_dir)
            .env(TASK_ID_ENV, task.id.as_str())
            .env(TASK_NAME_ENV, &task.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            Error::Backend(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;
        let pid = child.id();
        debug!(task_id = %task.id, pid = ?pid, program = %self.program.display(), "subprocess started");

        let _tracking = match (pid, &self.coordinator) {
            (Some(pid), Some(coordinator)) => Some(ProcessTracking {
                coordinator: coordinator.clone(),
                id: coordinator.track_process(pid, &format!("task {}", task.id)),
            }),
            _ => None,
        };

        let output = child.wait_with_output();
        tokio::pin!(output);

        let output = tokio::select! {
            result = &mut output => result?,
            _ = request.cancel.cancelled() => {
                if let Some(pid) = pid {
                    send_signal(pid, "TERM").await;
                }
                match tokio::time::timeout(self.kill_grace, &mut output).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(task_id = %task.id, pid = ?pid, "subprocess ignored SIGTERM, killing");
                        return Err(Error::Backend(
                            "subprocess killed after cancellation".to_string(),
                        ));
                    }
                }
            }
        };

        debug!(task_id = %task.id, status = %output.status, "subprocess exited");
        Ok(ExecutionOutput::new(
            output.status.code(),
            combine_output(&output.stdout, &output.stderr),
        ))
    }
}
