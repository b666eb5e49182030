//! Multi-factor priority scoring.
//!
//! [`score`] is a pure function: the same task, profile and `now` always
//! produce the same [`TaskScore`]. Missing or malformed inputs fall back to
//! fixed defaults instead of failing.
//!
//! | Factor             | Rule                                                          |
//! |--------------------|---------------------------------------------------------------|
//! | due date           | none 2, overdue 10, today 9, ≤7 days 7, ≤30 days 5, later 3   |
//! | dependency         | has children 8, has parent 3, neither 5                       |
//! | user priority      | high/urgent 10, medium/normal 5, low 2, number clamped 0..=10 |
//! | project importance | max over memberships from the profile map, unmapped 5         |
//! | age                | >60 days 8, ≥30 days 6, ≥7 days 4, else 2                     |
//!
//! Due dates compare by UTC calendar day.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::task::{DueDate, PriorityLevel, Task};
use crate::{Error, Result};

pub const DUE_NONE: f64 = 2.0;
pub const DUE_OVERDUE: f64 = 10.0;
pub const DUE_TODAY: f64 = 9.0;
pub const DUE_THIS_WEEK: f64 = 7.0;
pub const DUE_THIS_MONTH: f64 = 5.0;
pub const DUE_LATER: f64 = 3.0;

pub const DEPENDENCY_PARENT: f64 = 8.0;
pub const DEPENDENCY_CHILD: f64 = 3.0;
pub const DEPENDENCY_NONE: f64 = 5.0;

pub const PRIORITY_HIGH: f64 = 10.0;
pub const PRIORITY_MEDIUM: f64 = 5.0;
pub const PRIORITY_LOW: f64 = 2.0;
pub const PRIORITY_DEFAULT: f64 = PRIORITY_MEDIUM;

pub const PROJECT_DEFAULT: f64 = 5.0;

pub const AGE_STALE: f64 = 8.0;
pub const AGE_OLD: f64 = 6.0;
pub const AGE_AGING: f64 = 4.0;
pub const AGE_FRESH: f64 = 2.0;

const FACTOR_MAX: f64 = 10.0;

/// Weights applied to each factor score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub due_date: f64,
    pub dependency: f64,
    pub user_priority: f64,
    pub project_importance: f64,
    pub age: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            due_date: 10.0,
            dependency: 8.0,
            user_priority: 7.0,
            project_importance: 5.0,
            age: 3.0,
        }
    }
}

impl PriorityWeights {
    /// Reject negative or non-finite weights.
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("due_date", self.due_date),
            ("dependency", self.dependency),
            ("user_priority", self.user_priority),
            ("project_importance", self.project_importance),
            ("age", self.age),
        ];
        for (name, weight) in named {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Config(format!(
                    "weight '{}' must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }
        Ok(())
    }
}

/// Everything the scorer needs besides the task: weights and the
/// per-project importance map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringProfile {
    pub weights: PriorityWeights,
    pub project_importance: BTreeMap<String, f64>,
}

impl ScoringProfile {
    pub fn new(weights: PriorityWeights) -> Self {
        Self {
            weights,
            project_importance: BTreeMap::new(),
        }
    }

    pub fn with_project(mut self, project: &str, importance: f64) -> Self {
        self.project_importance
            .insert(project.to_string(), importance);
        self
    }
}

/// Per-factor sub-scores, each in `0.0..=10.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FactorScores {
    pub due_date: f64,
    pub dependency: f64,
    pub user_priority: f64,
    pub project_importance: f64,
    pub age: f64,
}

/// Score breakdown plus weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TaskScore {
    pub factors: FactorScores,
    pub total: f64,
}

/// Score a task against a profile at instant `now`.
pub fn score(task: &Task, profile: &ScoringProfile, now: DateTime<Utc>) -> TaskScore {
    let factors = FactorScores {
        due_date: due_date_score(task.due.as_ref(), now),
        dependency: dependency_score(task),
        user_priority: user_priority_score(task.priority_level().as_ref()),
        project_importance: project_importance_score(task, &profile.project_importance),
        age: age_score(task.reference_instant(), now),
    };
    let w = &profile.weights;
    let total = factors.due_date * w.due_date
        + factors.dependency * w.dependency
        + factors.user_priority * w.user_priority
        + factors.project_importance * w.project_importance
        + factors.age * w.age;
    TaskScore { factors, total }
}

pub fn due_date_score(due: Option<&DueDate>, now: DateTime<Utc>) -> f64 {
    let Some(due) = due else {
        return DUE_NONE;
    };
    let days = (due.day() - now.date_naive()).num_days();
    match days {
        d if d < 0 => DUE_OVERDUE,
        0 => DUE_TODAY,
        1..=7 => DUE_THIS_WEEK,
        8..=30 => DUE_THIS_MONTH,
        _ => DUE_LATER,
    }
}

pub fn dependency_score(task: &Task) -> f64 {
    if task.is_parent() {
        DEPENDENCY_PARENT
    } else if task.is_child() {
        DEPENDENCY_CHILD
    } else {
        DEPENDENCY_NONE
    }
}

pub fn user_priority_score(level: Option<&PriorityLevel>) -> f64 {
    match level {
        None => PRIORITY_DEFAULT,
        Some(PriorityLevel::Numeric(n)) => clamp_factor(*n, PRIORITY_DEFAULT),
        Some(PriorityLevel::Label(label)) => label_score(label),
    }
}

fn label_score(label: &str) -> f64 {
    let normalized = label.trim().to_lowercase();
    match normalized.as_str() {
        "high" | "urgent" => PRIORITY_HIGH,
        "medium" | "normal" => PRIORITY_MEDIUM,
        "low" => PRIORITY_LOW,
        // numeric strings like "7" count as raw numbers
        other => other
            .parse::<f64>()
            .map(|n| clamp_factor(n, PRIORITY_DEFAULT))
            .unwrap_or(PRIORITY_DEFAULT),
    }
}

pub fn project_importance_score(task: &Task, importance: &BTreeMap<String, f64>) -> f64 {
    task.project_ids()
        .into_iter()
        .map(|project| {
            importance
                .get(project)
                .map(|value| clamp_factor(*value, PROJECT_DEFAULT))
                .unwrap_or(PROJECT_DEFAULT)
        })
        .fold(None, |best: Option<f64>, value| {
            Some(best.map_or(value, |b| b.max(value)))
        })
        .unwrap_or(PROJECT_DEFAULT)
}

pub fn age_score(reference: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(reference) = reference else {
        return AGE_FRESH;
    };
    let days = (now - reference).num_days();
    if days > 60 {
        AGE_STALE
    } else if days >= 30 {
        AGE_OLD
    } else if days >= 7 {
        AGE_AGING
    } else {
        AGE_FRESH
    }
}

fn clamp_factor(value: f64, fallback: f64) -> f64 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(0.0, FACTOR_MAX)
    }
}
