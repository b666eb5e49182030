//! Concurrency pool for in-flight executions.
//!
//! The `ConcurrencyPool` tracks every admitted task, enforces the configured
//! capacity, and lets shutdown wait for (or cancel) whatever is still
//! running. Admission and insertion happen under one lock, so a reserved
//! slot can never leak between a capacity check and the insert.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::shutdown::ShutdownSignal;

/// One admitted, in-flight execution.
///
/// Owned by the pool from admission to release. The execution routine only
/// ever sees the cancellation token handed out by [`ConcurrencyPool::try_admit`].
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    /// The task being executed.
    pub task_id: TaskId,
    /// When the slot was admitted.
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    fn new(task_id: TaskId, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            started_at: Utc::now(),
            cancel,
        }
    }

    /// Request cooperative cancellation of the running unit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Bounded set of in-flight executions.
///
/// # Example
///
/// ```ignore
/// use conductor::orchestration::{ConcurrencyPool, ShutdownCoordinator};
///
/// let coordinator = ShutdownCoordinator::new(Default::default());
/// let pool = ConcurrencyPool::new(3, coordinator.signal());
///
/// assert!(pool.has_capacity());
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct ConcurrencyPool {
    /// Active executions indexed by task ID.
    active: Mutex<HashMap<TaskId, ExecutionHandle>>,
    /// Maximum number of concurrent executions.
    capacity: usize,
    /// Admission is refused once this reports draining or stopped.
    shutdown: ShutdownSignal,
    /// Parent of every handle's token.
    cancel_root: CancellationToken,
    /// Signalled on every release.
    released: Notify,
}

impl ConcurrencyPool {
    /// Create a pool admitting at most `capacity` tasks at once.
    pub fn new(capacity: usize, shutdown: ShutdownSignal) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            capacity,
            shutdown,
            cancel_root: CancellationToken::new(),
            released: Notify::new(),
        }
    }

    /// Reserve a slot for `task_id` and record its handle in one step.
    ///
    /// Returns the cancellation token the execution routine must observe.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once shutdown has begun, regardless of capacity
    /// - [`Error::AlreadyAdmitted`] if the task already holds a slot
    /// - [`Error::PoolFull`] if every slot is taken
    pub fn try_admit(&self, task_id: &TaskId) -> Result<CancellationToken> {
        let mut active = self.active.lock();
        if self.shutdown.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        if active.contains_key(task_id) {
            return Err(Error::AlreadyAdmitted(task_id.clone()));
        }
        if active.len() >= self.capacity {
            return Err(Error::PoolFull { max: self.capacity });
        }
        let token = self.cancel_root.child_token();
        active.insert(
            task_id.clone(),
            ExecutionHandle::new(task_id.clone(), token.clone()),
        );
        debug!(task_id = %task_id, active = active.len(), capacity = self.capacity, "slot admitted");
        Ok(token)
    }

    /// Free the slot held by `task_id`.
    ///
    /// Releasing an id that holds no slot is a no-op. Returns whether a slot
    /// was actually freed.
    pub fn release(&self, task_id: &TaskId) -> bool {
        let removed = self.active.lock().remove(task_id).is_some();
        if removed {
            debug!(task_id = %task_id, "slot released");
        }
        self.released.notify_waiters();
        removed
    }

    /// Number of tasks currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.capacity
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.active.lock().contains_key(task_id)
    }

    /// Snapshot of the active handles.
    pub fn handles(&self) -> Vec<ExecutionHandle> {
        self.active.lock().values().cloned().collect()
    }

    /// Cancel one execution. Returns false if the task holds no slot.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        match self.active.lock().get(task_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight execution, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let count = self.active_count();
        self.cancel_root.cancel();
        count
    }

    /// Future that resolves at the next release.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Wait until no slot is held or `timeout` elapses.
    ///
    /// Returns true if the pool emptied in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a release in between is not missed.
            let notified = self.released.notified();
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_count() == 0;
            }
        }
    }
}
