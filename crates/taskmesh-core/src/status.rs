//! Status enums for worker instances and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a worker instance.
///
/// ```text
/// Starting -> Active | Failed
/// Active   -> Draining | Failed
/// Draining -> Terminated
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Launched, readiness probe pending.
    #[default]
    Starting,
    /// Ready and accepting assignments.
    Active,
    /// Finishing in-flight work, accepting nothing new.
    Draining,
    /// Shut down after draining (or forced after the grace period).
    Terminated,
    /// Probe failure, heartbeat timeout or crash. Never resurrected.
    Failed,
}

impl WorkerState {
    /// All states, in declaration order.
    pub const ALL: [WorkerState; 5] = [
        Self::Starting,
        Self::Active,
        Self::Draining,
        Self::Terminated,
        Self::Failed,
    ];

    /// Returns true for Terminated and Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Only Active instances are candidates for new assignments.
    pub fn accepts_assignments(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Starting and Active instances count against `max_instances`.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Active)
                | (Self::Starting, Self::Failed)
                | (Self::Active, Self::Draining)
                | (Self::Active, Self::Failed)
                | (Self::Draining, Self::Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a Task in the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a worker (released by a failed worker, or awaiting the
    /// next contribution).
    #[default]
    Queued,
    /// Bound to exactly one worker.
    Assigned,
    /// All expected contributions aggregated.
    Completed,
    /// Failed on a worker, shed, or timed out for good.
    Failed,
}

impl TaskStatus {
    /// All statuses, in declaration order.
    pub const ALL: [TaskStatus; 4] = [Self::Queued, Self::Assigned, Self::Completed, Self::Failed];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
