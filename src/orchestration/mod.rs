//! Orchestration engine.
//!
//! The work queue, the concurrency pool, the shutdown coordinator, and the
//! dispatcher that drives them against the collaborator traits in
//! [`backend`].

pub mod backend;
pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod shutdown;

pub use backend::{
    ExecutionBackend, ExecutionOutput, ExecutionRequest, TaskOutcome, TaskSource,
    WorkspaceProvisioner,
};
pub use dispatcher::{DispatchConfig, DispatchEvent, DispatchStep, Dispatcher};
pub use pool::{ConcurrencyPool, ExecutionHandle};
pub use queue::{Eligibility, Ineligible, QueuedTask, UpsertSummary, WorkQueue};
pub use shutdown::{
    OperationGuard, ProcessExit, ShutdownConfig, ShutdownCoordinator, ShutdownOutcome,
    ShutdownPhase, ShutdownReport, ShutdownSignal, TrackId, TrackedSession,
};
