//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: Failures that lose information (unreported outcomes, failed cleanups)
//! - WARN: Recoverable conditions (discovery errors, failed tasks, forced kills)
//! - INFO: State transitions (admitted, completed, shutdown requested/complete)
//! - DEBUG: Loop cycles, slot accounting, config loading
//! - TRACE: Not used by the crate itself
//!
//! `RUST_LOG` takes precedence. Otherwise debug mode comes from `--debug`
//! or `CONDUCTOR_DEBUG=1`, and the default level is info.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::Result;

pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Truncated at startup.
    File(PathBuf),
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Debug mode requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
///
/// # Errors
///
/// Returns an error if the log file or its directory cannot be created.
pub fn init(debug: bool, target: LogTarget) -> Result<()> {
    let debug = debug || env_debug();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let _ = match target {
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogTarget::File(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let file = File::create(&path)?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
        }
    };
    Ok(())
}
