//! Shutdown coordination.
//!
//! The `ShutdownCoordinator` owns the process-wide lifecycle flag
//! (running → draining → stopped), the sets of resources that must be
//! settled before exit, and the ordered cleanup callbacks.
//!
//! # Sequence
//!
//! 1. `request_shutdown` flips running → draining and cancels the shared
//!    token; loops observe it at the top of every iteration.
//! 2. `shutdown` waits for tracked operations until the drain deadline,
//!    sends SIGTERM to tracked subprocesses and SIGKILL after the grace
//!    period, then closes tracked sessions.
//! 3. Cleanup callbacks run in registration order. A failing or panicking
//!    callback is logged and the rest still run.
//! 4. The signal listener is aborted and the phase becomes stopped.
//!
//! Tracking is explicit: whoever tracks a resource untracks it on its own
//! success and failure paths. [`OperationGuard`] does this on drop.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Default time allowed for in-flight work to finish after shutdown starts.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 60;

/// Default time between SIGTERM and SIGKILL for tracked subprocesses.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Exit code for a shutdown that had to cut work short.
pub const FORCED_EXIT_CODE: u8 = 3;

const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle phase of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownPhase {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl ShutdownPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Stopped,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Read-only view of the shutdown flag, cheap to clone into loops and pools.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    phase: Arc<AtomicU8>,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }

    /// True once draining or stopped.
    pub fn is_shutting_down(&self) -> bool {
        !self.is_running()
    }

    /// Resolves when shutdown is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Timeouts governing the draining phase.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Budget for in-flight work, measured from the draining transition.
    pub drain_timeout: Duration,
    /// Wait between graceful and forceful termination of subprocesses.
    pub kill_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
        }
    }
}

/// Whether shutdown finished within its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean,
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::Forced => FORCED_EXIT_CODE,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ShutdownOutcome::Clean)
    }
}

/// What the stop sequence did.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub outcome: ShutdownOutcome,
    /// Operations still tracked when the drain deadline passed.
    pub abandoned_operations: Vec<String>,
    pub processes_terminated: usize,
    pub processes_killed: usize,
    pub sessions_closed: usize,
    /// Names of cleanup callbacks that failed or panicked.
    pub failed_callbacks: Vec<String>,
}

impl ShutdownReport {
    fn new() -> Self {
        Self {
            outcome: ShutdownOutcome::Clean,
            abandoned_operations: Vec::new(),
            processes_terminated: 0,
            processes_killed: 0,
            sessions_closed: 0,
            failed_callbacks: Vec::new(),
        }
    }
}

/// A long-lived resource session that must be closed before exit.
#[async_trait]
pub trait TrackedSession: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

/// Identifier for a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(u64);

/// Tracked operation that untracks itself on drop.
#[must_use = "dropping the guard untracks the operation immediately"]
pub struct OperationGuard {
    id: TrackId,
    inner: Arc<Inner>,
}

impl OperationGuard {
    pub fn id(&self) -> TrackId {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.inner.untrack_operation(self.id);
    }
}

/// How a tracked subprocess ended during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Gone before any signal was sent.
    AlreadyExited,
    /// Exited after SIGTERM.
    Terminated,
    /// Still alive after the grace period and sent SIGKILL.
    Killed,
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    label: String,
}

#[derive(Default)]
struct Trackables {
    operations: HashMap<TrackId, String>,
    processes: HashMap<TrackId, TrackedProcess>,
    sessions: HashMap<TrackId, Weak<dyn TrackedSession>>,
}

impl Trackables {
    fn live_sessions(&self) -> usize {
        self.sessions.values().filter(|s| s.strong_count() > 0).count()
    }
}

struct Inner {
    phase: Arc<AtomicU8>,
    token: CancellationToken,
    /// Cancelled by a second interrupt: skip remaining waits.
    force: CancellationToken,
    config: ShutdownConfig,
    next_id: AtomicU64,
    trackables: Mutex<Trackables>,
    operations_changed: Notify,
    cleanups: Mutex<Vec<(String, CleanupFn)>>,
    draining_since: Mutex<Option<Instant>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn next_id(&self) -> TrackId {
        TrackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn untrack_operation(&self, id: TrackId) {
        let removed = self.trackables.lock().operations.remove(&id);
        if removed.is_some() {
            self.operations_changed.notify_waiters();
        }
    }
}

/// Process-wide shutdown coordinator.
///
/// Cloning is cheap; all clones share the same state.
///
/// # Example
///
/// ```ignore
/// let coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
/// coordinator.install_signal_handlers()?;
/// coordinator.register_cleanup("flush", || async { Ok(()) });
///
/// let guard = coordinator.track_operation("task 42");
/// // ... work ...
/// drop(guard);
///
/// let report = coordinator.shutdown().await;
/// std::process::exit(report.outcome.exit_code() as i32);
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                phase: Arc::new(AtomicU8::new(ShutdownPhase::Running as u8)),
                token: CancellationToken::new(),
                force: CancellationToken::new(),
                config,
                next_id: AtomicU64::new(1),
                trackables: Mutex::new(Trackables::default()),
                operations_changed: Notify::new(),
                cleanups: Mutex::new(Vec::new()),
                draining_since: Mutex::new(None),
                signal_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.inner.config
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            phase: Arc::clone(&self.inner.phase),
            token: self.inner.token.clone(),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Move from running to draining.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        let transitioned = self
            .inner
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u8,
                ShutdownPhase::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !transitioned {
            debug!(reason, phase = %self.phase(), "shutdown already in progress");
            return false;
        }

        *self.inner.draining_since.lock() = Some(Instant::now());
        let (operations, processes, sessions) = self.tracked_counts();
        info!(
            reason,
            operations, processes, sessions, "shutdown requested"
        );
        self.inner.token.cancel();
        true
    }

    /// Skip whatever waiting is left in the draining phase.
    pub fn force(&self) {
        warn!("forced shutdown requested");
        self.request_shutdown("forced");
        self.inner.force.cancel();
    }

    /// Time left before the drain deadline. Full budget while running.
    pub fn remaining_drain_time(&self) -> Duration {
        if self.inner.force.is_cancelled() {
            return Duration::ZERO;
        }
        match *self.inner.draining_since.lock() {
            Some(since) => self
                .inner
                .config
                .drain_timeout
                .saturating_sub(since.elapsed()),
            None => self.inner.config.drain_timeout,
        }
    }

    // ---- tracking ----

    /// Track a pending async operation until the guard drops.
    pub fn track_operation(&self, label: &str) -> OperationGuard {
        let id = self.inner.next_id();
        self.inner
            .trackables
            .lock()
            .operations
            .insert(id, label.to_string());
        OperationGuard {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn untrack_operation(&self, id: TrackId) {
        self.inner.untrack_operation(id);
    }

    /// Track a subprocess by pid.
    pub fn track_process(&self, pid: u32, label: &str) -> TrackId {
        let id = self.inner.next_id();
        self.inner.trackables.lock().processes.insert(
            id,
            TrackedProcess {
                pid,
                label: label.to_string(),
            },
        );
        id
    }

    pub fn untrack_process(&self, id: TrackId) {
        self.inner.trackables.lock().processes.remove(&id);
    }

    /// Track a session weakly; a dropped session simply disappears.
    pub fn track_session<S>(&self, session: &Arc<S>) -> TrackId
    where
        S: TrackedSession + 'static,
    {
        let session: Arc<dyn TrackedSession> = session.clone();
        let id = self.inner.next_id();
        self.inner
            .trackables
            .lock()
            .sessions
            .insert(id, Arc::downgrade(&session));
        id
    }

    pub fn untrack_session(&self, id: TrackId) {
        self.inner.trackables.lock().sessions.remove(&id);
    }

    pub fn operation_count(&self) -> usize {
        self.inner.trackables.lock().operations.len()
    }

    pub fn process_count(&self) -> usize {
        self.inner.trackables.lock().processes.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.trackables.lock().live_sessions()
    }

    fn tracked_counts(&self) -> (usize, usize, usize) {
        let trackables = self.inner.trackables.lock();
        (
            trackables.operations.len(),
            trackables.processes.len(),
            trackables.live_sessions(),
        )
    }

    // ---- cleanup ----

    /// Register a callback for the stop sequence. Callbacks run in
    /// registration order.
    pub fn register_cleanup<F, Fut>(&self, name: &str, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || callback().boxed());
        self.inner.cleanups.lock().push((name.to_string(), boxed));
    }

    // ---- signals ----

    /// Listen for SIGINT/SIGTERM (Ctrl-C off Unix) and start draining.
    ///
    /// A second interrupt while draining forces shutdown. The listener is
    /// aborted by [`shutdown`](Self::shutdown), returning signal handling to
    /// the runtime default.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let coordinator = self.clone();

        #[cfg(unix)]
        let task = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                loop {
                    let name = tokio::select! {
                        _ = sigint.recv() => "SIGINT",
                        _ = sigterm.recv() => "SIGTERM",
                    };
                    coordinator.on_interrupt(name);
                }
            })
        };

        #[cfg(not(unix))]
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                coordinator.on_interrupt("ctrl-c");
            }
        });

        if let Some(previous) = self.inner.signal_task.lock().replace(task) {
            previous.abort();
        }
        debug!("signal handlers installed");
        Ok(())
    }

    fn on_interrupt(&self, name: &str) {
        if !self.request_shutdown(&format!("signal {}", name)) {
            warn!(signal = name, "second interrupt while draining");
            self.force();
        }
    }

    fn restore_signal_handlers(&self) {
        if let Some(task) = self.inner.signal_task.lock().take() {
            task.abort();
            debug!("signal handlers removed");
        }
    }

    // ---- stop sequence ----

    /// Run the draining phase and the stop sequence.
    ///
    /// Safe to call more than once; later calls find nothing left to do
    /// and report a clean outcome.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.request_shutdown("stop requested");
        let mut report = ShutdownReport::new();

        report.abandoned_operations = self.wait_for_operations().await;
        if !report.abandoned_operations.is_empty() {
            warn!(
                remaining = report.abandoned_operations.len(),
                "drain timeout elapsed with operations in flight"
            );
            report.outcome = ShutdownOutcome::Forced;
        }

        self.terminate_processes(&mut report).await;
        self.close_sessions(&mut report).await;
        self.run_cleanups(&mut report).await;
        self.restore_signal_handlers();

        if self.inner.force.is_cancelled() {
            report.outcome = ShutdownOutcome::Forced;
        }
        self.inner
            .phase
            .store(ShutdownPhase::Stopped as u8, Ordering::SeqCst);
        info!(
            outcome = ?report.outcome,
            abandoned = report.abandoned_operations.len(),
            terminated = report.processes_terminated,
            killed = report.processes_killed,
            failed_callbacks = report.failed_callbacks.len(),
            "shutdown complete"
        );
        report
    }

    /// Wait for tracked operations; returns labels still pending at the deadline.
    async fn wait_for_operations(&self) -> Vec<String> {
        let deadline = Instant::now() + self.remaining_drain_time();
        loop {
            let changed = self.inner.operations_changed.notified();
            let pending: Vec<String> = self
                .inner
                .trackables
                .lock()
                .operations
                .values()
                .cloned()
                .collect();
            if pending.is_empty() {
                return pending;
            }
            debug!(pending = pending.len(), "waiting for operations");
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(deadline) => return self.pending_operations(),
                _ = self.inner.force.cancelled() => return self.pending_operations(),
            }
        }
    }

    fn pending_operations(&self) -> Vec<String> {
        self.inner
            .trackables
            .lock()
            .operations
            .values()
            .cloned()
            .collect()
    }

    async fn terminate_processes(&self, report: &mut ShutdownReport) {
        let processes: Vec<(TrackId, TrackedProcess)> = self
            .inner
            .trackables
            .lock()
            .processes
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        if processes.is_empty() {
            return;
        }

        let grace = self.inner.config.kill_grace;
        let exits = futures::future::join_all(processes.iter().map(|(_, process)| async move {
            let exit = terminate_process(process.pid, grace).await;
            (process, exit)
        }))
        .await;

        for (process, exit) in exits {
            match exit {
                ProcessExit::AlreadyExited => {}
                ProcessExit::Terminated => {
                    info!(pid = process.pid, label = %process.label, "subprocess terminated");
                    report.processes_terminated += 1;
                }
                ProcessExit::Killed => {
                    warn!(pid = process.pid, label = %process.label, "subprocess killed after grace period");
                    report.processes_killed += 1;
                    report.outcome = ShutdownOutcome::Forced;
                }
            }
        }

        let mut trackables = self.inner.trackables.lock();
        for (id, _) in processes {
            trackables.processes.remove(&id);
        }
    }

    async fn close_sessions(&self, report: &mut ShutdownReport) {
        let sessions: Vec<(TrackId, Arc<dyn TrackedSession>)> = {
            let mut trackables = self.inner.trackables.lock();
            let live = trackables
                .sessions
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|s| (*id, s)))
                .collect();
            trackables.sessions.clear();
            live
        };

        for (_, session) in sessions {
            match session.close().await {
                Ok(()) => {
                    debug!(session = session.name(), "session closed");
                    report.sessions_closed += 1;
                }
                Err(e) => warn!(session = session.name(), error = %e, "failed to close session"),
            }
        }
    }

    async fn run_cleanups(&self, report: &mut ShutdownReport) {
        let callbacks: Vec<(String, CleanupFn)> = std::mem::take(&mut *self.inner.cleanups.lock());
        for (name, callback) in callbacks {
            let result = AssertUnwindSafe(async move { callback().await })
                .catch_unwind()
                .await;
            let failure = match result {
                Ok(Ok(())) => {
                    debug!(callback = %name, "cleanup callback finished");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => Error::Cleanup {
                    name: name.clone(),
                    message: "panicked".to_string(),
                },
            };
            error!(callback = %name, error = %failure, "cleanup callback failed");
            report.failed_callbacks.push(name);
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_process(pid: u32, grace: Duration) -> ProcessExit {
    if !process_alive(pid).await {
        return ProcessExit::AlreadyExited;
    }
    send_signal(pid, "TERM").await;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
        if !process_alive(pid).await {
            return ProcessExit::Terminated;
        }
    }

    send_signal(pid, "KILL").await;
    ProcessExit::Killed
}

/// Deliver a signal by name via `kill(1)`.
#[cfg(unix)]
pub async fn send_signal(pid: u32, signal: &str) {
    let result = tokio::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .output()
        .await;
    if let Err(e) = result {
        warn!(pid, signal, error = %e, "failed to send signal");
    }
}

#[cfg(not(unix))]
pub async fn send_signal(pid: u32, signal: &str) {
    warn!(pid, signal, "signals unsupported on this platform");
}

#[cfg(unix)]
async fn process_alive(pid: u32) -> bool {
    tokio::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn process_alive(_pid: u32) -> bool {
    false
}
