//! Test fixtures for integration tests.
//!
//! Provides:
//! - A scriptable in-memory task source
//! - A fake execution backend with per-task behaviour and gates
//! - A workspace provisioner backed by a temporary directory
//! - A harness wiring them into a running dispatcher

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use conductor::core::task::{DueDate, PriorityLevel, Task, TaskId};
use conductor::orchestration::{
    DispatchConfig, DispatchEvent, Dispatcher, ExecutionBackend, ExecutionOutput,
    ExecutionRequest, ShutdownConfig, ShutdownCoordinator, ShutdownReport, TaskOutcome,
    TaskSource, WorkspaceProvisioner,
};
use conductor::{Error, Result};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

// ---- tasks ----

/// A task with only an id and a name.
pub fn test_task(id: &str) -> Task {
    Task::new(id, id)
}

/// Task due `days` from today (negative is overdue).
pub fn due_in(id: &str, days: i64) -> Task {
    let day = (Utc::now() + ChronoDuration::days(days)).date_naive();
    test_task(id).with_due(DueDate::Day(day))
}

/// `count` tasks with equal scores, ids `task-0..`.
pub fn independent_tasks(count: usize) -> Vec<Task> {
    (0..count).map(|i| test_task(&format!("task-{}", i))).collect()
}

/// Task A of the regression scenario: overdue, otherwise default.
pub fn regression_task_a() -> Task {
    due_in("A", -1)
}

/// Task B of the regression scenario: far due date, parent, high priority.
pub fn regression_task_b() -> Task {
    due_in("B", 60)
        .with_children(2)
        .with_priority(PriorityLevel::Label("high".to_string()))
}

// ---- source ----

/// In-memory task source. Reported tasks disappear from later fetches.
#[derive(Default)]
pub struct FakeSource {
    tasks: Mutex<Vec<Task>>,
    reports: Mutex<Vec<(TaskId, TaskOutcome)>>,
    started: Mutex<Vec<TaskId>>,
    fetches: AtomicUsize,
    failing_fetches: AtomicUsize,
    fail_reports: AtomicBool,
    panic_reports: AtomicBool,
    stopped: AtomicBool,
}

impl FakeSource {
    pub fn new(tasks: Vec<Task>) -> Arc<Self> {
        let source = Self::default();
        *source.tasks.lock() = tasks;
        Arc::new(source)
    }

    pub fn push(&self, task: Task) {
        self.tasks.lock().push(task);
    }

    /// The next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::SeqCst);
    }

    /// Panic inside `report_outcome`, leaving the task listed.
    pub fn panic_on_report(&self, panic: bool) {
        self.panic_reports.store(panic, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<(TaskId, TaskOutcome)> {
        self.reports.lock().clone()
    }

    pub fn reports_for(&self, id: &str) -> Vec<TaskOutcome> {
        self.reports
            .lock()
            .iter()
            .filter(|(task_id, _)| task_id.as_str() == id)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskSource for FakeSource {
    async fn fetch_eligible_tasks(&self) -> Result<Vec<Task>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_fetches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_fetches.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Source("source unavailable".to_string()));
        }
        Ok(self.tasks.lock().clone())
    }

    async fn report_outcome(&self, task_id: &TaskId, outcome: &TaskOutcome) -> Result<()> {
        if self.panic_reports.load(Ordering::SeqCst) {
            panic!("report handler crashed for {}", task_id);
        }
        self.reports.lock().push((task_id.clone(), outcome.clone()));
        self.tasks.lock().retain(|t| &t.id != task_id);
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(Error::Source("report rejected".to_string()));
        }
        Ok(())
    }

    async fn mark_started(&self, task_id: &TaskId) -> Result<()> {
        self.started.lock().push(task_id.clone());
        Ok(())
    }

    async fn mark_stopped(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---- backend ----

/// What the fake backend does for a task.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Exit 0 with the task name as output.
    Succeed,
    /// Exit with the given non-zero code.
    ExitCode(i32),
    /// Return an error from `run`.
    Error(String),
    /// Panic inside `run`.
    Panic,
    /// Block until the gate for this task is opened.
    Gated,
    /// Block until cancelled, then return an error.
    Hang,
    /// Block forever, ignoring cancellation.
    Stuck,
}

#[derive(Default)]
pub struct FakeBackend {
    behaviors: Mutex<HashMap<TaskId, Behavior>>,
    gates: Mutex<HashMap<TaskId, Arc<Semaphore>>>,
    running: Mutex<HashSet<TaskId>>,
    started: Mutex<Vec<TaskId>>,
    max_running: AtomicUsize,
    working_dirs: Mutex<Vec<PathBuf>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, id: &str, behavior: Behavior) {
        self.behaviors.lock().insert(TaskId::from(id), behavior);
    }

    fn gate(&self, id: &TaskId) -> Arc<Semaphore> {
        Arc::clone(
            self.gates
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    /// Let a gated task finish successfully.
    pub fn open(&self, id: &str) {
        self.gate(&TaskId::from(id)).add_permits(1);
    }

    /// Tasks in the order the backend first saw them.
    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().clone()
    }

    pub fn running(&self) -> HashSet<TaskId> {
        self.running.lock().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn working_dirs(&self) -> Vec<PathBuf> {
        self.working_dirs.lock().clone()
    }

    fn enter(&self, id: &TaskId) {
        self.started.lock().push(id.clone());
        let mut running = self.running.lock();
        running.insert(id.clone());
        self.max_running.fetch_max(running.len(), Ordering::SeqCst);
    }

    fn leave(&self, id: &TaskId) {
        self.running.lock().remove(id);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutput> {
        let id = request.task.id.clone();
        let behavior = self
            .behaviors
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        self.working_dirs.lock().push(request.working_dir.clone());
        self.enter(&id);

        let result = match behavior {
            Behavior::Succeed => Ok(ExecutionOutput::new(Some(0), request.task.name.clone())),
            Behavior::ExitCode(code) => Ok(ExecutionOutput::new(Some(code), "failed")),
            Behavior::Error(message) => Err(Error::Backend(message)),
            Behavior::Panic => {
                self.leave(&id);
                panic!("fake backend panic for {}", id);
            }
            Behavior::Gated => {
                let gate = self.gate(&id);
                tokio::select! {
                    permit = gate.acquire() => {
                        permit.map(|p| p.forget()).ok();
                        Ok(ExecutionOutput::new(Some(0), request.task.name.clone()))
                    }
                    _ = request.cancel.cancelled() => Err(Error::Backend("cancelled".to_string())),
                }
            }
            Behavior::Hang => {
                request.cancel.cancelled().await;
                Err(Error::Backend("cancelled".to_string()))
            }
            Behavior::Stuck => {
                std::future::pending::<()>().await;
                Err(Error::Backend("unreachable".to_string()))
            }
        };
        self.leave(&id);
        result
    }
}

// ---- workspaces ----

/// Provisioner creating directories under a temp root and counting calls.
pub struct FakeProvisioner {
    root: TempDir,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: TempDir::new().unwrap(),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceProvisioner for FakeProvisioner {
    async fn acquire(&self, task_id: &TaskId) -> Result<PathBuf> {
        let path = self.root.path().join(task_id.as_str());
        tokio::fs::create_dir_all(&path).await?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }

    async fn release(&self, task_id: &TaskId) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(self.root.path().join(task_id.as_str())).await;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- harness ----

/// Fast loop periods so tests finish quickly.
pub fn fast_dispatch_config(capacity: usize) -> DispatchConfig {
    DispatchConfig {
        discovery_interval: Duration::from_millis(25),
        dispatch_poll: Duration::from_millis(10),
        execution_timeout: Duration::from_secs(5),
        max_concurrent: capacity,
        handle_signals: false,
    }
}

pub fn fast_shutdown_config() -> ShutdownConfig {
    ShutdownConfig {
        drain_timeout: Duration::from_secs(2),
        kill_grace: Duration::from_millis(100),
    }
}

/// A dispatcher wired to fakes, plus its event stream.
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub coordinator: ShutdownCoordinator,
    pub source: Arc<FakeSource>,
    pub backend: Arc<FakeBackend>,
    pub provisioner: Arc<FakeProvisioner>,
    pub events: mpsc::UnboundedReceiver<DispatchEvent>,
    /// Events passed over by `wait_for`, oldest first.
    skipped: VecDeque<DispatchEvent>,
}

impl Harness {
    pub fn new(capacity: usize, tasks: Vec<Task>) -> Self {
        Self::with_config(tasks, fast_dispatch_config(capacity), fast_shutdown_config())
    }

    pub fn with_config(tasks: Vec<Task>, dispatch: DispatchConfig, shutdown: ShutdownConfig) -> Self {
        let source = FakeSource::new(tasks);
        let backend = FakeBackend::new();
        let provisioner = FakeProvisioner::new();
        let coordinator = ShutdownCoordinator::new(shutdown);
        let (tx, events) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&source) as Arc<dyn TaskSource>,
                Arc::clone(&backend) as Arc<dyn ExecutionBackend>,
                coordinator.clone(),
                dispatch,
            )
            .with_workspaces(Arc::clone(&provisioner) as Arc<dyn WorkspaceProvisioner>)
            .with_events(tx),
        );

        Self {
            dispatcher,
            coordinator,
            source,
            backend,
            provisioner,
            events,
            skipped: VecDeque::new(),
        }
    }

    /// Start `Dispatcher::run` in the background.
    pub fn start(&self) -> JoinHandle<Result<ShutdownReport>> {
        tokio::spawn(Arc::clone(&self.dispatcher).run())
    }

    /// Next event from the channel, failing the test after [`WAIT`].
    ///
    /// Events already passed over by [`wait_for`](Self::wait_for) are not
    /// returned here.
    pub async fn next_event(&mut self) -> DispatchEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for dispatch event")
            .expect("event channel closed")
    }

    /// The oldest unconsumed event that matches.
    ///
    /// Non-matching events are kept for later `wait_for` calls, so waiting
    /// for an admission never loses a completion.
    pub async fn wait_for<F>(&mut self, mut matches: F) -> DispatchEvent
    where
        F: FnMut(&DispatchEvent) -> bool,
    {
        if let Some(index) = self.skipped.iter().position(&mut matches) {
            if let Some(event) = self.skipped.remove(index) {
                return event;
            }
        }
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
            self.skipped.push_back(event);
        }
    }

    /// Wait for the next admission and return the task id.
    pub async fn next_admitted(&mut self) -> TaskId {
        match self
            .wait_for(|e| matches!(e, DispatchEvent::Admitted { .. }))
            .await
        {
            DispatchEvent::Admitted { task_id, .. } => task_id,
            _ => unreachable!(),
        }
    }

    /// Wait until `count` tasks have finished, successfully or not.
    pub async fn wait_finished(&mut self, count: usize) -> Vec<DispatchEvent> {
        let mut finished = Vec::new();
        while finished.len() < count {
            let event = self
                .wait_for(|e| {
                    matches!(
                        e,
                        DispatchEvent::Completed { .. } | DispatchEvent::Failed { .. }
                    )
                })
                .await;
            finished.push(event);
        }
        finished
    }

    /// Request shutdown and wait for `run` to return.
    pub async fn stop(&self, run: JoinHandle<Result<ShutdownReport>>) -> ShutdownReport {
        self.coordinator.request_shutdown("test finished");
        tokio::time::timeout(WAIT, run)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher panicked")
            .expect("dispatcher failed")
    }
}
