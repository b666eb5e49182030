//! Per-task working directories under a common root.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::backend::WorkspaceProvisioner;

pub struct DirectoryProvisioner {
    root: PathBuf,
    keep: bool,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep: false,
        }
    }

    /// Leave directories in place on release.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used for `task_id`.
    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(sanitize(task_id.as_str()))
    }
}

/// Map an id to a single path component, one-to-one.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte is
/// written as `%XX`. The empty id maps to a lone `%`, which no other id
/// can produce.
fn sanitize(id: &str) -> String {
    if id.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn acquire(&self, task_id: &TaskId) -> Result<PathBuf> {
        let path = self.path_for(task_id);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            Error::Workspace(format!("cannot create {}: {}", path.display(), e))
        })?;
        debug!(task_id = %task_id, path = %path.display(), "workspace acquired");
        Ok(path)
    }

    async fn release(&self, task_id: &TaskId) -> Result<()> {
        if self.keep {
            return Ok(());
        }
        let path = self.path_for(task_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(task_id = %task_id, "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Workspace(format!(
                "cannot remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
