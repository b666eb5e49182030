//! Work queue of discovered, not-yet-dispatched tasks.
//!
//! The queue is a map from task id to the latest snapshot. Ordering is
//! computed on demand because scores drift with time and with every refresh,
//! so a physically sorted heap would go stale between reads. Ties on the
//! total score are broken by first-insertion order.
//!
//! The queue itself is not synchronized; the dispatcher shares it as
//! `Arc<tokio::sync::Mutex<WorkQueue>>` and holds that one lock across the
//! remove-then-admit hand-off.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::score::{score, ScoringProfile, TaskScore};
use crate::core::task::{Task, TaskId};

/// Rules deciding which stored tasks are visible to selection.
#[derive(Debug, Clone)]
pub struct Eligibility {
    /// Accepted work states, lowercased. Empty accepts any state.
    work_states: BTreeSet<String>,
    /// Hide tasks that already have an assignee.
    skip_assigned: bool,
}

impl Default for Eligibility {
    fn default() -> Self {
        Self {
            work_states: BTreeSet::new(),
            skip_assigned: true,
        }
    }
}

impl Eligibility {
    pub fn new<I, S>(work_states: I, skip_assigned: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            work_states: work_states
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect(),
            skip_assigned,
        }
    }

    /// Check one task. `completed` holds ids finished during this run.
    pub fn check(&self, task: &Task, completed: &HashSet<TaskId>) -> Result<(), Ineligible> {
        if task.completed {
            return Err(Ineligible::Completed);
        }
        if self.skip_assigned {
            if let Some(assignee) = &task.assignee {
                return Err(Ineligible::Assigned(assignee.clone()));
            }
        }
        if !self.work_states.is_empty() {
            let state = task.status.as_deref().map(|s| s.trim().to_lowercase());
            if !state.is_some_and(|s| self.work_states.contains(&s)) {
                return Err(Ineligible::WorkState(task.status.clone()));
            }
        }
        if let Some(blocker) = task
            .unresolved_dependencies()
            .find(|dep| !completed.contains(*dep))
        {
            return Err(Ineligible::BlockedBy(blocker.clone()));
        }
        Ok(())
    }
}

/// Why a stored task is hidden from selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    Completed,
    Assigned(String),
    WorkState(Option<String>),
    BlockedBy(TaskId),
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::Completed => write!(f, "completed"),
            Ineligible::Assigned(who) => write!(f, "assigned to {}", who),
            Ineligible::WorkState(Some(state)) => write!(f, "state '{}' not accepted", state),
            Ineligible::WorkState(None) => write!(f, "no work state"),
            Ineligible::BlockedBy(id) => write!(f, "blocked by {}", id),
        }
    }
}

/// A stored snapshot with its insertion sequence number.
///
/// Returned by [`WorkQueue::remove`] so a failed hand-off can put the task
/// back with its original position in the tie-break order.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    seq: u64,
}

impl QueuedTask {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Counts from one [`WorkQueue::upsert`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Snapshots that arrived already completed.
    pub dropped: usize,
}

/// Logical priority queue of known tasks.
#[derive(Debug, Default)]
pub struct WorkQueue {
    entries: HashMap<TaskId, QueuedTask>,
    next_seq: u64,
    completed: HashSet<TaskId>,
    eligibility: Eligibility,
}

impl WorkQueue {
    pub fn new(eligibility: Eligibility) -> Self {
        Self {
            eligibility,
            ..Default::default()
        }
    }

    /// Insert or replace snapshots by id.
    ///
    /// A replaced snapshot keeps its original sequence number, so refreshing
    /// a task never moves it behind equally scored newcomers. Snapshots of
    /// tasks that are complete, or that finished during this run, are
    /// dropped.
    pub fn upsert<I>(&mut self, tasks: I) -> UpsertSummary
    where
        I: IntoIterator<Item = Task>,
    {
        let mut summary = UpsertSummary::default();
        for task in tasks {
            if task.completed {
                self.entries.remove(&task.id);
                self.completed.insert(task.id);
                summary.dropped += 1;
                continue;
            }
            if self.completed.contains(&task.id) {
                summary.dropped += 1;
                continue;
            }
            match self.entries.get_mut(&task.id) {
                Some(entry) => {
                    entry.task = task;
                    summary.updated += 1;
                }
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.entries.insert(task.id.clone(), QueuedTask { task, seq });
                    summary.inserted += 1;
                }
            }
        }
        summary
    }

    /// Drop stored tasks whose ids are not in `present`.
    ///
    /// Returns the number removed.
    pub fn retain_present(&mut self, present: &HashSet<TaskId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| present.contains(id));
        before - self.entries.len()
    }

    /// The highest-scoring eligible task, without removing it.
    pub fn peek_best(
        &self,
        profile: &ScoringProfile,
        now: DateTime<Utc>,
    ) -> Option<(&Task, TaskScore)> {
        self.scored(profile, now)
            .into_iter()
            .min_by(rank_order)
            .map(|(entry, score)| (&entry.task, score))
    }

    /// All eligible tasks in dispatch order.
    pub fn rank(&self, profile: &ScoringProfile, now: DateTime<Utc>) -> Vec<(&Task, TaskScore)> {
        let mut scored = self.scored(profile, now);
        scored.sort_by(rank_order);
        scored
            .into_iter()
            .map(|(entry, score)| (&entry.task, score))
            .collect()
    }

    /// Remove a task at hand-off.
    pub fn remove(&mut self, id: &TaskId) -> Option<QueuedTask> {
        self.entries.remove(id)
    }

    /// Put back a task whose admission failed.
    ///
    /// A newer snapshot stored in the meantime wins over the restored one,
    /// but the original sequence number is kept either way.
    pub fn restore(&mut self, queued: QueuedTask) {
        match self.entries.get_mut(&queued.task.id) {
            Some(existing) => existing.seq = existing.seq.min(queued.seq),
            None => {
                self.entries.insert(queued.task.id.clone(), queued);
            }
        }
    }

    /// Record a task finished during this run; it satisfies dependencies
    /// from now on even if the source has not caught up.
    pub fn mark_completed(&mut self, id: &TaskId) {
        self.entries.remove(id);
        self.completed.insert(id.clone());
    }

    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    /// Why a stored task is not selectable, or `None` if it is.
    pub fn ineligibility(&self, id: &TaskId) -> Option<Ineligible> {
        self.entries
            .get(id)
            .and_then(|entry| self.eligibility.check(&entry.task, &self.completed).err())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.entries.get(id).map(|entry| &entry.task)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn scored(
        &self,
        profile: &ScoringProfile,
        now: DateTime<Utc>,
    ) -> Vec<(&QueuedTask, TaskScore)> {
        self.entries
            .values()
            .filter(|entry| self.eligibility.check(&entry.task, &self.completed).is_ok())
            .map(|entry| (entry, score(&entry.task, profile, now)))
            .collect()
    }
}

/// Higher total first, then lower sequence number.
fn rank_order(a: &(&QueuedTask, TaskScore), b: &(&QueuedTask, TaskScore)) -> std::cmp::Ordering {
    b.1.total
        .total_cmp(&a.1.total)
        .then_with(|| a.0.seq.cmp(&b.0.seq))
}
