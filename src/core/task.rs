//! Task data model.
//!
//! A [`Task`] is an immutable snapshot of an external work item as reported
//! by the task source. The orchestrator never edits a snapshot; every
//! discovery cycle replaces the stored copy wholesale by identifier.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute key consulted when a task carries no typed priority.
pub const PRIORITY_ATTRIBUTE: &str = "priority";

/// Attribute key consulted for an extra project membership.
pub const PROJECT_ATTRIBUTE: &str = "project";

/// Opaque identifier assigned by the task source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A due date, either a full instant or a calendar day.
///
/// A bare date is interpreted as midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DueDate {
    At(DateTime<Utc>),
    Day(NaiveDate),
}

impl DueDate {
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            DueDate::At(at) => *at,
            DueDate::Day(day) => day.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    /// Calendar day in UTC.
    pub fn day(&self) -> NaiveDate {
        self.instant().date_naive()
    }
}

/// User-assigned priority: either an enumerated label or a raw number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorityLevel {
    Numeric(f64),
    Label(String),
}

impl PriorityLevel {
    /// Interpret a loosely typed attribute value.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(PriorityLevel::Numeric),
            serde_json::Value::String(s) => Some(PriorityLevel::Label(s.clone())),
            _ => None,
        }
    }
}

/// A dependency edge as reported by the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    /// Whether the source considers the dependency finished.
    #[serde(default)]
    pub resolved: bool,
}

/// An external work item with scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub due: Option<DueDate>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub parent: Option<TaskId>,
    #[serde(default)]
    pub child_count: usize,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Work state reported by the source (e.g. "to do", "in progress").
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub projects: BTreeSet<String>,
    #[serde(default)]
    pub priority: Option<PriorityLevel>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Source-specific extensions not modelled above.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Create a task with the given id and name and no other metadata.
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: String::new(),
            due: None,
            assignee: None,
            completed: false,
            parent: None,
            child_count: 0,
            dependencies: Vec::new(),
            status: None,
            tags: BTreeSet::new(),
            projects: BTreeSet::new(),
            priority: None,
            created_at: None,
            updated_at: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_due(mut self, due: DueDate) -> Self {
        self.due = Some(due);
        self
    }

    pub fn with_assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<TaskId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_children(mut self, count: usize) -> Self {
        self.child_count = count;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<TaskId>, resolved: bool) -> Self {
        self.dependencies.push(Dependency {
            task_id: task_id.into(),
            resolved,
        });
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.projects.insert(project.to_string());
        self
    }

    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn mark_completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// A task with at least one child.
    pub fn is_parent(&self) -> bool {
        self.child_count > 0
    }

    /// A task nested under another task.
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Dependencies the source has not marked resolved.
    pub fn unresolved_dependencies(&self) -> impl Iterator<Item = &TaskId> {
        self.dependencies
            .iter()
            .filter(|dep| !dep.resolved)
            .map(|dep| &dep.task_id)
    }

    /// The typed priority, falling back to the `priority` attribute.
    pub fn priority_level(&self) -> Option<PriorityLevel> {
        self.priority.clone().or_else(|| {
            self.attributes
                .get(PRIORITY_ATTRIBUTE)
                .and_then(PriorityLevel::from_value)
        })
    }

    /// Project memberships, including a `project` attribute if present.
    pub fn project_ids(&self) -> BTreeSet<&str> {
        let mut ids: BTreeSet<&str> = self.projects.iter().map(String::as_str).collect();
        if let Some(serde_json::Value::String(project)) = self.attributes.get(PROJECT_ATTRIBUTE) {
            ids.insert(project.as_str());
        }
        ids
    }

    /// Instant used for age: creation, else last modification.
    pub fn reference_instant(&self) -> Option<DateTime<Utc>> {
        self.created_at.or(self.updated_at)
    }
}
