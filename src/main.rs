use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use conductor::adapters::{CommandBackend, DirectoryProvisioner, FileTaskSource};
use conductor::log::LogTarget;
use conductor::orchestration::{Dispatcher, ShutdownCoordinator, TaskSource, WorkQueue};
use conductor::{Config, Result};

const FATAL_EXIT_CODE: u8 = 1;

/// Conductor - priority task orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG=...        Full log filter, overrides both"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log to stderr instead of ~/.conductor/conductor.log
    #[arg(long)]
    pub log_stderr: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Discover and execute tasks until interrupted
    Run,

    /// Print eligible tasks in dispatch order
    Rank {
        /// Show at most this many tasks
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Print the effective configuration
    Config {
        /// Write the default configuration if no file exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("conductor: {}", e);
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

fn run_cli(cli: Cli) -> Result<u8> {
    let target = if cli.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::File(Config::log_path()?)
    };
    conductor::log::init(cli.debug, target)?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run => run_orchestrator(config_path),
        Command::Rank { limit } => run_rank(config_path, limit),
        Command::Config { init } => run_config(config_path, init),
    }
}

/// Start the orchestrator and block until shutdown completes.
///
/// Returns the process exit code for the shutdown outcome.
fn run_orchestrator(config_path: Option<&Path>) -> Result<u8> {
    let config = Config::load(config_path)?;
    info!(
        capacity = config.orchestrator.max_concurrent,
        tasks = %config.tasks_path().display(),
        "conductor starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let coordinator = ShutdownCoordinator::new(config.shutdown_config());
        let source = Arc::new(FileTaskSource::open(
            config.tasks_path(),
            config.outcomes_path(),
        )?);
        let backend = Arc::new(
            CommandBackend::new(&config.backend.command)?.with_coordinator(coordinator.clone()),
        );
        let workspaces = Arc::new(
            DirectoryProvisioner::new(config.workspace_root()).keep(config.workspace.keep),
        );

        let dispatcher = Arc::new(
            Dispatcher::new(source, backend, coordinator, config.dispatch_config())
                .with_workspaces(workspaces)
                .with_scoring(config.scoring.clone())
                .with_eligibility(config.eligibility()),
        );

        eprintln!(
            "conductor running with {} slot(s); press Ctrl-C to stop",
            config.orchestrator.max_concurrent
        );
        let report = dispatcher.run().await?;
        eprintln!(
            "conductor stopped ({:?}, {} abandoned, {} killed)",
            report.outcome,
            report.abandoned_operations.len(),
            report.processes_killed
        );
        Ok(report.outcome.exit_code())
    })
}

/// Print the ranked queue once, using the same scorer and eligibility rules
/// as the dispatcher.
fn run_rank(config_path: Option<&Path>, limit: Option<usize>) -> Result<u8> {
    let config = Config::load(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let tasks = rt.block_on(async {
        let source = FileTaskSource::open(config.tasks_path(), config.outcomes_path())?;
        source.fetch_eligible_tasks().await
    })?;

    let mut queue = WorkQueue::new(config.eligibility());
    queue.upsert(tasks);
    let ranked = queue.rank(&config.scoring, Utc::now());
    let shown = limit.unwrap_or(ranked.len());

    println!(
        "{:>4}  {:>7}  {:>5} {:>5} {:>5} {:>5} {:>5}  {:<10}  NAME",
        "#", "SCORE", "DUE", "DEP", "PRI", "PROJ", "AGE", "ID"
    );
    for (position, (task, score)) in ranked.iter().take(shown).enumerate() {
        let f = &score.factors;
        println!(
            "{:>4}  {:>7.1}  {:>5.1} {:>5.1} {:>5.1} {:>5.1} {:>5.1}  {:<10}  {}",
            position + 1,
            score.total,
            f.due_date,
            f.dependency,
            f.user_priority,
            f.project_importance,
            f.age,
            task.id.short(),
            task.name
        );
    }
    let hidden = queue.size() - ranked.len();
    if hidden > 0 {
        println!("({} task(s) not eligible)", hidden);
    }
    Ok(0)
}

fn run_config(config_path: Option<&Path>, init: bool) -> Result<u8> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };
    if init {
        if path.exists() {
            eprintln!("config already exists at {}", path.display());
        } else {
            Config::default().save(&path)?;
            eprintln!("wrote default config to {}", path.display());
        }
    }
    let config = Config::load(Some(&path))?;
    print!("{}", config.to_toml()?);
    Ok(0)
}
