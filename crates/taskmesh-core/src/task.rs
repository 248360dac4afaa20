//! Task and assignment types.

use crate::{CoreError, TaskId, TaskStatus, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A Task represents a logical unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Opaque payload handed to the worker (JSON by convention).
    pub payload: String,

    /// Number of distinct worker contributions needed before the task's
    /// results are aggregated.
    pub expected_contributions: u32,

    /// Scheduling priority; higher runs first and is shed last.
    pub priority: i32,

    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,

    /// Current task status.
    pub status: TaskStatus,

    /// Task labels/metadata.
    pub labels: BTreeMap<String, String>,

    /// Why the task failed, if it did.
    pub failure_reason: Option<String>,
}

impl Task {
    /// Create a new single-contribution Task with default priority.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            payload: payload.into(),
            expected_contributions: 1,
            priority: 0,
            submitted_at: Utc::now(),
            status: TaskStatus::Queued,
            labels: BTreeMap::new(),
            failure_reason: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to require several distinct contributions.
    pub fn with_expected_contributions(mut self, count: u32) -> Self {
        self.expected_contributions = count;
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Check the task can be submitted.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.expected_contributions == 0 {
            return Err(CoreError::InvalidInput(format!(
                "task {} expects zero contributions",
                self.id
            )));
        }
        if self.id.as_str().is_empty() {
            return Err(CoreError::InvalidInput("task id is empty".to_string()));
        }
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Binding of one task to one worker for its current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    /// 1 for the first placement, incremented on every re-placement.
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new(r#"{"query":"rust"}"#);
        assert_eq!(task.expected_contributions, 1);
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_zero_expected_contributions_rejected() {
        let task = Task::new("{}").with_expected_contributions(0);
        assert!(matches!(task.validate(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_builders() {
        let task = Task::new("{}")
            .with_id(TaskId::new("t-1"))
            .with_priority(7)
            .with_expected_contributions(3)
            .with_label("tenant", "acme");

        assert_eq!(task.id.as_str(), "t-1");
        assert_eq!(task.priority, 7);
        assert_eq!(task.expected_contributions, 3);
        assert_eq!(task.labels.get("tenant").map(String::as_str), Some("acme"));
    }
}
