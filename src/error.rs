use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Concurrency pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Shutdown in progress, not accepting new work")]
    ShuttingDown,

    #[error("Task already admitted: {0}")]
    AlreadyAdmitted(TaskId),

    #[error("Task source error: {0}")]
    Source(String),

    #[error("Execution backend error: {0}")]
    Backend(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Cleanup callback '{name}' failed: {message}")]
    Cleanup { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
