//! Dispatcher: the top-level driver.
//!
//! Runs the discovery loop and the dispatch loop side by side and owns the
//! per-task execution routine. All shared state goes through the
//! [`WorkQueue`] lock or the [`ConcurrencyPool`] lock.
//!
//! # Scheduling quantum
//!
//! The dispatch loop sleeps for `dispatch_poll` when it has nothing to do,
//! but is woken early whenever discovery inserts tasks or an execution
//! releases its slot. The poll period is therefore an upper bound on
//! dispatch latency, not the typical case.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::score::{ScoringProfile, TaskScore};
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::backend::{
    ExecutionBackend, ExecutionRequest, TaskOutcome, TaskSource, WorkspaceProvisioner,
};
use crate::orchestration::pool::ConcurrencyPool;
use crate::orchestration::queue::{Eligibility, UpsertSummary, WorkQueue};
use crate::orchestration::shutdown::{
    OperationGuard, ShutdownCoordinator, ShutdownOutcome, ShutdownReport,
};

/// Default discovery period.
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 30;

/// Default dispatch poll quantum.
pub const DEFAULT_DISPATCH_POLL_MS: u64 = 500;

/// Default bound on a single execution.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 300;

/// Default pool capacity.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Timing and capacity knobs for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub discovery_interval: Duration,
    pub dispatch_poll: Duration,
    pub execution_timeout: Duration,
    pub max_concurrent: usize,
    /// Install SIGINT/SIGTERM listeners in [`Dispatcher::run`].
    pub handle_signals: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
            dispatch_poll: Duration::from_millis(DEFAULT_DISPATCH_POLL_MS),
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            handle_signals: true,
        }
    }
}

/// Lifecycle transitions, mirrored from the structured log.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A task won selection and holds a slot.
    Admitted {
        task_id: TaskId,
        /// Total score at selection time.
        score: f64,
    },
    /// The backend reported success.
    Completed { task_id: TaskId, output: String },
    /// Backend failure, timeout, panic, or cancellation.
    Failed { task_id: TaskId, error: String },
    /// Both loops have stopped taking new work.
    ShutdownRequested,
    /// The stop sequence finished.
    ShutdownComplete { outcome: ShutdownOutcome },
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStep {
    /// A task was admitted and its execution spawned.
    Dispatched { task_id: TaskId, score: TaskScore },
    /// Every slot is taken.
    NoCapacity,
    /// Nothing eligible is queued.
    Idle,
    /// The selected entry was discarded; try again straight away.
    Retry,
    /// Draining or stopped.
    ShuttingDown,
}

/// Releases the pool slot and wakes the dispatch loop when dropped.
///
/// Moved into the execution routine, so the slot is freed on every exit
/// path, unwinding included.
struct SlotGuard {
    pool: Arc<ConcurrencyPool>,
    wake: Arc<Notify>,
    task_id: TaskId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(&self.task_id);
        self.wake.notify_one();
    }
}

/// Releases the task's workspace.
///
/// [`release`](Self::release) awaits the provisioner on the normal path. If
/// the execution routine unwinds first, the release is spawned from `drop`.
struct WorkspaceLease {
    workspaces: Option<Arc<dyn WorkspaceProvisioner>>,
    task_id: TaskId,
}

impl WorkspaceLease {
    async fn release(mut self) {
        if let Some(workspaces) = self.workspaces.take() {
            release_workspace(workspaces, &self.task_id).await;
        }
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        let Some(workspaces) = self.workspaces.take() else {
            return;
        };
        let task_id = self.task_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release_workspace(workspaces, &task_id).await });
            }
            Err(_) => warn!(task_id = %task_id, "no runtime left to release workspace"),
        }
    }
}

async fn release_workspace(workspaces: Arc<dyn WorkspaceProvisioner>, task_id: &TaskId) {
    if let Err(e) = workspaces.release(task_id).await {
        warn!(task_id = %task_id, error = %e, "failed to release workspace");
    }
}

/// Top-level orchestrator.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use conductor::orchestration::{DispatchConfig, Dispatcher, ShutdownCoordinator};
///
/// let coordinator = ShutdownCoordinator::new(Default::default());
/// let dispatcher = Arc::new(
///     Dispatcher::new(source, backend, coordinator, DispatchConfig::default())
///         .with_workspaces(provisioner),
/// );
/// let report = dispatcher.run().await?;
/// std::process::exit(report.outcome.exit_code() as i32);
/// ```
pub struct Dispatcher {
    source: Arc<dyn TaskSource>,
    backend: Arc<dyn ExecutionBackend>,
    workspaces: Option<Arc<dyn WorkspaceProvisioner>>,
    queue: Arc<Mutex<WorkQueue>>,
    pool: Arc<ConcurrencyPool>,
    coordinator: ShutdownCoordinator,
    /// Swapped whole; readers clone the `Arc`.
    scoring: RwLock<Arc<ScoringProfile>>,
    /// Signalled on queue insert and slot release.
    wake: Arc<Notify>,
    events: Option<mpsc::UnboundedSender<DispatchEvent>>,
    config: DispatchConfig,
    /// Incremented when a fetch starts.
    fetch_epoch: AtomicU64,
    /// Finished task ids and the fetch epoch current when they finished.
    finished: parking_lot::Mutex<HashMap<TaskId, u64>>,
}

impl Dispatcher {
    /// Create a dispatcher with default scoring and eligibility.
    ///
    /// # Arguments
    ///
    /// * `source` - Where tasks come from and outcomes go
    /// * `backend` - What runs each task
    /// * `coordinator` - Shutdown state shared with the pool
    /// * `config` - Loop periods, execution timeout and pool capacity
    pub fn new(
        source: Arc<dyn TaskSource>,
        backend: Arc<dyn ExecutionBackend>,
        coordinator: ShutdownCoordinator,
        config: DispatchConfig,
    ) -> Self {
        let pool = Arc::new(ConcurrencyPool::new(
            config.max_concurrent,
            coordinator.signal(),
        ));
        Self {
            source,
            backend,
            workspaces: None,
            queue: Arc::new(Mutex::new(WorkQueue::default())),
            pool,
            coordinator,
            scoring: RwLock::new(Arc::new(ScoringProfile::default())),
            wake: Arc::new(Notify::new()),
            events: None,
            config,
            fetch_epoch: AtomicU64::new(0),
            finished: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceProvisioner>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    pub fn with_scoring(self, profile: ScoringProfile) -> Self {
        self.set_scoring(profile);
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.queue = Arc::new(Mutex::new(WorkQueue::new(eligibility)));
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the scoring profile; the next selection uses it.
    pub fn set_scoring(&self, profile: ScoringProfile) {
        *self.scoring.write() = Arc::new(profile);
        self.wake.notify_one();
    }

    pub fn scoring(&self) -> Arc<ScoringProfile> {
        self.scoring.read().clone()
    }

    pub fn pool(&self) -> &Arc<ConcurrencyPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<Mutex<WorkQueue>> {
        &self.queue
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ---- discovery ----

    /// Fetch once and merge into the queue.
    ///
    /// Tasks that vanished from the source are pruned. Snapshots of tasks
    /// that are executing, or that finished after the fetch began, are
    /// ignored: the source may not have seen their outcome yet.
    ///
    /// # Errors
    ///
    /// Returns the source's error; the queue is left untouched.
    pub async fn discover_once(&self) -> Result<UpsertSummary> {
        let epoch = self.fetch_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let tasks = self.source.fetch_eligible_tasks().await?;
        let present: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();

        let (summary, pruned, queued) = {
            let mut queue = self.queue.lock().await;
            let stale: HashSet<TaskId> = {
                let mut finished = self.finished.lock();
                finished.retain(|_, finished_at| *finished_at >= epoch);
                finished.keys().cloned().collect()
            };
            let pruned = queue.retain_present(&present);
            let summary = queue.upsert(tasks.into_iter().filter(|task| {
                !self.pool.contains(&task.id) && !stale.contains(&task.id)
            }));
            (summary, pruned, queue.size())
        };

        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            dropped = summary.dropped,
            pruned,
            queued,
            "discovery cycle"
        );
        if summary.inserted + summary.updated > 0 {
            self.wake.notify_one();
        }
        Ok(summary)
    }

    async fn discovery_loop(self: Arc<Self>) {
        let signal = self.coordinator.signal();
        loop {
            if signal.is_shutting_down() {
                break;
            }
            tokio::select! {
                result = self.discover_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "discovery failed, retrying next cycle");
                    }
                }
                _ = signal.cancelled() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.discovery_interval) => {}
                _ = signal.cancelled() => break,
            }
        }
        debug!("discovery loop stopped");
    }

    // ---- dispatch ----

    /// Select the best eligible task and hand it to the pool.
    ///
    /// The queue lock is held from selection through admission, so no
    /// other caller can pick the same task and a failed admission puts the
    /// task straight back.
    pub async fn dispatch_once(self: &Arc<Self>) -> DispatchStep {
        if self.coordinator.is_shutting_down() {
            return DispatchStep::ShuttingDown;
        }
        if !self.pool.has_capacity() {
            return DispatchStep::NoCapacity;
        }

        let profile = self.scoring();
        let mut queue = self.queue.lock().await;
        let (task_id, score) = match queue.peek_best(&profile, Utc::now()) {
            Some((task, score)) => (task.id.clone(), score),
            None => return DispatchStep::Idle,
        };
        let Some(queued) = queue.remove(&task_id) else {
            return DispatchStep::Retry;
        };

        let cancel = match self.pool.try_admit(&task_id) {
            Ok(cancel) => cancel,
            Err(Error::AlreadyAdmitted(_)) => {
                debug!(task_id = %task_id, "dropped snapshot of task already executing");
                return DispatchStep::Retry;
            }
            Err(e) => {
                queue.restore(queued);
                debug!(task_id = %task_id, error = %e, "admission failed, task returned to queue");
                return match e {
                    Error::ShuttingDown => DispatchStep::ShuttingDown,
                    _ => DispatchStep::NoCapacity,
                };
            }
        };
        drop(queue);

        info!(
            task_id = %task_id,
            score = score.total,
            active = self.pool.active_count(),
            capacity = self.pool.capacity(),
            "task admitted"
        );
        self.emit(DispatchEvent::Admitted {
            task_id: task_id.clone(),
            score: score.total,
        });

        let slot = SlotGuard {
            pool: Arc::clone(&self.pool),
            wake: Arc::clone(&self.wake),
            task_id: task_id.clone(),
        };
        let operation = self
            .coordinator
            .track_operation(&format!("execute {}", task_id));
        tokio::spawn(Arc::clone(self).execute(queued.task, cancel, slot, operation));

        DispatchStep::Dispatched { task_id, score }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let signal = self.coordinator.signal();
        loop {
            match self.dispatch_once().await {
                DispatchStep::Dispatched { .. } => continue,
                DispatchStep::Retry => tokio::task::yield_now().await,
                DispatchStep::ShuttingDown => break,
                DispatchStep::NoCapacity | DispatchStep::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.dispatch_poll) => {}
                        _ = self.wake.notified() => {}
                        _ = signal.cancelled() => break,
                    }
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    // ---- execution ----

    async fn execute(
        self: Arc<Self>,
        task: Task,
        cancel: CancellationToken,
        slot: SlotGuard,
        operation: OperationGuard,
    ) {
        let task_id = task.id.clone();
        if let Err(e) = self.source.mark_started(&task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to mark task started");
        }

        let (outcome, lease) = match self.acquire_workspace(&task_id).await {
            Ok(dir) => {
                let lease = WorkspaceLease {
                    workspaces: self.workspaces.clone(),
                    task_id: task_id.clone(),
                };
                (self.run_backend(task, dir, cancel).await, Some(lease))
            }
            Err(e) => (
                TaskOutcome::failed(format!("workspace unavailable: {}", e)),
                None,
            ),
        };
        self.record_outcome(&task_id, outcome).await;

        if let Some(lease) = lease {
            lease.release().await;
        }
        drop(slot);
        drop(operation);
    }

    async fn acquire_workspace(&self, task_id: &TaskId) -> Result<PathBuf> {
        match &self.workspaces {
            Some(workspaces) => workspaces.acquire(task_id).await,
            None => Ok(std::env::current_dir()?),
        }
    }

    async fn run_backend(
        &self,
        task: Task,
        working_dir: PathBuf,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let timeout = self.config.execution_timeout;
        let grace = self.coordinator.config().kill_grace;
        let request = ExecutionRequest {
            task,
            working_dir,
            timeout,
            cancel: cancel.clone(),
        };
        let run = AssertUnwindSafe(self.backend.run(request)).catch_unwind();

        // The backend sees the token first and gets the grace period to
        // stop on its own before it is dropped.
        let abandoned = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, run) => match result {
                Err(_) => TaskOutcome::failed(Error::Timeout(timeout).to_string()),
                Ok(Err(panic)) => {
                    TaskOutcome::failed(format!("execution panicked: {}", panic_message(&panic)))
                }
                Ok(Ok(Err(e))) => TaskOutcome::failed(e.to_string()),
                Ok(Ok(Ok(output))) => output.into_outcome(),
            },
            _ = abandoned => TaskOutcome::failed("cancelled during shutdown"),
        }
    }

    /// Stamp `task_id` with the current fetch epoch. Discovery ignores its
    /// snapshots from fetches that began at or before the stamp.
    fn mark_finished(&self, task_id: &TaskId) {
        self.finished
            .lock()
            .insert(task_id.clone(), self.fetch_epoch.load(Ordering::SeqCst));
    }

    async fn record_outcome(&self, task_id: &TaskId, outcome: TaskOutcome) {
        self.mark_finished(task_id);
        match &outcome {
            TaskOutcome::Succeeded { output } => {
                self.queue.lock().await.mark_completed(task_id);
                info!(task_id = %task_id, "task completed");
                self.emit(DispatchEvent::Completed {
                    task_id: task_id.clone(),
                    output: output.clone(),
                });
            }
            TaskOutcome::Failed { error } => {
                warn!(task_id = %task_id, error = %error, "task failed");
                self.emit(DispatchEvent::Failed {
                    task_id: task_id.clone(),
                    error: error.clone(),
                });
            }
        }

        if let Err(e) = self.source.report_outcome(task_id, &outcome).await {
            error!(task_id = %task_id, error = %e, "failed to report outcome");
        }
        // fetches that began while the report was in flight may still list the task
        self.mark_finished(task_id);
    }

    // ---- top level ----

    /// Run until shutdown, then drain and stop.
    ///
    /// # Errors
    ///
    /// Only if the signal listeners cannot be installed. Everything after
    /// that is recovered locally and reflected in the report's outcome.
    pub async fn run(self: Arc<Self>) -> Result<ShutdownReport> {
        if self.config.handle_signals {
            self.coordinator.install_signal_handlers()?;
        }
        let source = Arc::clone(&self.source);
        self.coordinator
            .register_cleanup("mark source stopped", move || async move {
                source.mark_stopped().await
            });

        info!(
            capacity = self.pool.capacity(),
            discovery_secs = self.config.discovery_interval.as_secs_f64(),
            poll_ms = self.config.dispatch_poll.as_millis() as u64,
            "dispatcher started"
        );

        let mut loops = JoinSet::new();
        let discovery = Arc::clone(&self);
        loops.spawn(async move {
            discovery.discovery_loop().await;
            "discovery"
        });
        let dispatch = Arc::clone(&self);
        loops.spawn(async move {
            dispatch.dispatch_loop().await;
            "dispatch"
        });

        // The first loop to exit takes the other one down with it.
        if let Some(result) = loops.join_next().await {
            self.loop_exited(result);
        }
        self.coordinator.request_shutdown("dispatcher loop exited");
        while let Some(result) = loops.join_next().await {
            self.loop_exited(result);
        }
        self.emit(DispatchEvent::ShutdownRequested);

        let in_flight = self.pool.active_count();
        let drained = self
            .pool
            .drain(self.coordinator.remaining_drain_time())
            .await;
        if !drained {
            let cancelled = self.pool.cancel_all();
            warn!(in_flight, cancelled, "drain timeout elapsed, cancelling executions");
        }

        let mut report = self.coordinator.shutdown().await;
        if !drained {
            report.outcome = ShutdownOutcome::Forced;
        }
        self.emit(DispatchEvent::ShutdownComplete {
            outcome: report.outcome,
        });
        Ok(report)
    }

    fn loop_exited(&self, result: std::result::Result<&'static str, tokio::task::JoinError>) {
        match result {
            Ok(name) => debug!(name, "loop exited"),
            Err(e) => {
                error!(error = %e, "dispatcher loop failed");
                self.coordinator.request_shutdown("dispatcher loop failed");
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
