//! Core domain models for the orchestrator.
//!
//! Task snapshots and the pure priority scorer. Nothing in here performs
//! I/O or holds shared state.

pub mod score;
pub mod task;

pub use score::{score, FactorScores, PriorityWeights, ScoringProfile, TaskScore};
pub use task::{Dependency, DueDate, PriorityLevel, Task, TaskId};
