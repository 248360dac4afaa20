//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use taskmesh_core::{Task, TaskAssignment, WorkerInstance};

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_workers: usize,
    pub pending_faults: usize,
}

/// Query string for `/v1/audit`.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    /// Return entries with a sequence number greater than this.
    #[serde(default)]
    pub since: u64,
}

/// Response for a single worker.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub kind: String,
    pub state: &'static str,
    pub load: u32,
    pub last_heartbeat: String,
    pub spawned_at: String,
    pub state_changed_at: String,
}

impl From<WorkerInstance> for WorkerResponse {
    fn from(w: WorkerInstance) -> Self {
        Self {
            worker_id: w.id.into_inner(),
            kind: w.kind,
            state: w.state.as_str(),
            load: w.load,
            last_heartbeat: w.last_heartbeat.to_rfc3339(),
            spawned_at: w.spawned_at.to_rfc3339(),
            state_changed_at: w.state_changed_at.to_rfc3339(),
        }
    }
}

/// Response for a task lookup.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: &'static str,
    pub priority: i32,
    pub submitted_at: String,
    pub assigned_to: Option<String>,
    pub attempt: Option<u32>,
    pub contributions_received: Option<usize>,
    pub contributions_expected: u32,
    pub failure_reason: Option<String>,
}

impl TaskResponse {
    pub fn new(
        task: Task,
        assignment: Option<TaskAssignment>,
        progress: Option<(usize, u32)>,
    ) -> Self {
        Self {
            task_id: task.id.into_inner(),
            status: task.status.as_str(),
            priority: task.priority,
            submitted_at: task.submitted_at.to_rfc3339(),
            assigned_to: assignment.as_ref().map(|a| a.worker_id.to_string()),
            attempt: assignment.map(|a| a.attempt),
            contributions_received: progress.map(|(have, _)| have),
            contributions_expected: task.expected_contributions,
            failure_reason: task.failure_reason,
        }
    }
}
