use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::score::ScoringProfile;
use crate::orchestration::dispatcher::{
    DispatchConfig, DEFAULT_DISCOVERY_INTERVAL_SECS, DEFAULT_DISPATCH_POLL_MS,
    DEFAULT_EXECUTION_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT,
};
use crate::orchestration::queue::Eligibility;
use crate::orchestration::shutdown::{
    ShutdownConfig, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_KILL_GRACE_SECS,
};
use crate::{Error, Result};

/// Loop periods, capacity and shutdown budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub discovery_interval_secs: u64,
    pub dispatch_poll_ms: u64,
    pub max_concurrent: usize,
    pub execution_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
            dispatch_poll_ms: DEFAULT_DISPATCH_POLL_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Accepted work states; empty accepts any.
    pub work_states: Vec<String>,
    pub skip_assigned: bool,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            work_states: Vec::new(),
            skip_assigned: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub tasks_path: String,
    pub outcomes_path: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            tasks_path: "~/.conductor/tasks.json".to_string(),
            outcomes_path: "~/.conductor/outcomes.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Program and arguments; `{id}`, `{name}` and `{description}` are
    /// substituted per task.
    pub command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "{description}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: String,
    /// Leave task directories behind after execution.
    pub keep: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "~/.conductor/workspaces".to_string(),
            keep: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub scoring: ScoringProfile,
    pub eligibility: EligibilityConfig,
    pub source: SourceConfig,
    pub backend: BackendConfig,
    pub workspace: WorkspaceConfig,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".conductor"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.log"))
    }

    /// Load from `path`, or the default location when `None`.
    ///
    /// A missing file yields the defaults. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        debug!(path = %path.display(), "loading config");
        let config = if path.exists() {
            Self::parse(&fs::read_to_string(&path)?)?
        } else {
            debug!("config file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Startup checks. Any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrent == 0 {
            return Err(Error::Config(
                "orchestrator.max_concurrent must be at least 1".to_string(),
            ));
        }
        let non_zero = [
            ("discovery_interval_secs", o.discovery_interval_secs),
            ("dispatch_poll_ms", o.dispatch_poll_ms),
            ("execution_timeout_secs", o.execution_timeout_secs),
            ("shutdown_timeout_secs", o.shutdown_timeout_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::Config(format!(
                    "orchestrator.{} must be greater than zero",
                    name
                )));
            }
        }
        if o.kill_grace_secs >= o.shutdown_timeout_secs {
            return Err(Error::Config(format!(
                "orchestrator.kill_grace_secs ({}) must be shorter than shutdown_timeout_secs ({})",
                o.kill_grace_secs, o.shutdown_timeout_secs
            )));
        }

        self.scoring.weights.validate()?;
        for (project, importance) in &self.scoring.project_importance {
            if !importance.is_finite() || *importance < 0.0 {
                return Err(Error::Config(format!(
                    "importance for project '{}' must be a non-negative number, got {}",
                    project, importance
                )));
            }
        }

        match self.backend.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(Error::Config("backend.command must not be empty".to_string())),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let o = &self.orchestrator;
        DispatchConfig {
            discovery_interval: Duration::from_secs(o.discovery_interval_secs),
            dispatch_poll: Duration::from_millis(o.dispatch_poll_ms),
            execution_timeout: Duration::from_secs(o.execution_timeout_secs),
            max_concurrent: o.max_concurrent,
            handle_signals: true,
        }
    }

    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            drain_timeout: Duration::from_secs(self.orchestrator.shutdown_timeout_secs),
            kill_grace: Duration::from_secs(self.orchestrator.kill_grace_secs),
        }
    }

    pub fn eligibility(&self) -> Eligibility {
        Eligibility::new(&self.eligibility.work_states, self.eligibility.skip_assigned)
    }

    pub fn tasks_path(&self) -> PathBuf {
        expand_tilde(&self.source.tasks_path)
    }

    pub fn outcomes_path(&self) -> PathBuf {
        expand_tilde(&self.source.outcomes_path)
    }

    pub fn workspace_root(&self) -> PathBuf {
        expand_tilde(&self.workspace.root)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
