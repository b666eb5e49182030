//! Task source backed by local files.
//!
//! Tasks are read from a JSON array on every fetch. Outcomes are appended
//! to a JSON-lines file; any task with a recorded outcome is excluded from
//! later fetches, including across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::backend::{TaskOutcome, TaskSource};

/// One line of the outcomes file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    pub reported_at: DateTime<Utc>,
}

pub struct FileTaskSource {
    tasks_path: PathBuf,
    outcomes_path: PathBuf,
    reported: Mutex<HashSet<TaskId>>,
    /// Serializes appends to the outcomes file.
    append_lock: tokio::sync::Mutex<()>,
}

impl FileTaskSource {
    /// Open a source, loading previously reported ids from `outcomes_path`.
    ///
    /// Unparseable outcome lines are skipped with a warning.
    pub fn open(tasks_path: impl Into<PathBuf>, outcomes_path: impl Into<PathBuf>) -> Result<Self> {
        let outcomes_path = outcomes_path.into();
        let reported = load_reported(&outcomes_path)?;
        debug!(
            outcomes = %outcomes_path.display(),
            reported = reported.len(),
            "file task source opened"
        );
        Ok(Self {
            tasks_path: tasks_path.into(),
            outcomes_path,
            reported: Mutex::new(reported),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn tasks_path(&self) -> &Path {
        &self.tasks_path
    }

    pub fn is_reported(&self, task_id: &TaskId) -> bool {
        self.reported.lock().contains(task_id)
    }

    /// Every task in the file, reported or not.
    pub async fn read_all(&self) -> Result<Vec<Task>> {
        let text = tokio::fs::read_to_string(&self.tasks_path)
            .await
            .map_err(|e| {
                Error::Source(format!(
                    "cannot read {}: {}",
                    self.tasks_path.display(),
                    e
                ))
            })?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn load_reported(path: &Path) -> Result<HashSet<TaskId>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let text = std::fs::read_to_string(path)?;
    let mut reported = HashSet::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeRecord>(line) {
            Ok(record) => {
                reported.insert(record.task_id);
            }
            Err(e) => warn!(line = index + 1, error = %e, "skipping malformed outcome record"),
        }
    }
    Ok(reported)
}

#[async_trait]
impl TaskSource for FileTaskSource {
    async fn fetch_eligible_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.read_all().await?;
        let reported = self.reported.lock();
        Ok(tasks
            .into_iter()
            .filter(|task| !reported.contains(&task.id))
            .collect())
    }

    async fn report_outcome(&self, task_id: &TaskId, outcome: &TaskOutcome) -> Result<()> {
        let record = OutcomeRecord {
            task_id: task_id.clone(),
            outcome: outcome.clone(),
            reported_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        if let Some(dir) = self.outcomes_path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outcomes_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.reported.lock().insert(task_id.clone());
        debug!(task_id = %task_id, success = outcome.is_success(), "outcome recorded");
        Ok(())
    }

    async fn mark_stopped(&self) -> Result<()> {
        info!(reported = self.reported.lock().len(), "file task source stopped");
        Ok(())
    }
}
