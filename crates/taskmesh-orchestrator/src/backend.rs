//! Worker execution backend seam.
//!
//! The orchestrator never runs task payloads itself. A [`WorkerBackend`]
//! launches instances and hands back a dispatch channel per instance; workers
//! report back through [`WorkerEvent`]s that the orchestrator pumps into
//! heartbeat, collect and completion handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use taskmesh_core::{FaultKind, TaskAssignment, TaskId, WorkerId, WorkerInstance};

/// Capacity of each per-worker dispatch channel.
pub const DISPATCH_CHANNEL_CAPACITY: usize = 64;

/// Backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("readiness probe failed: {0}")]
    ProbeFailed(String),

    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),
}

/// Message sent from the orchestrator to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Run a task payload for the given assignment.
    Execute {
        assignment: TaskAssignment,
        payload: String,
    },
    /// Cooperative cancellation of a running task.
    Cancel { task_id: TaskId },
    /// Stop the worker. `force` abandons in-flight tasks.
    Shutdown { force: bool },
}

/// Message sent from a worker to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Heartbeat {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        worker_id: WorkerId,
        result: String,
    },
    Failed {
        task_id: TaskId,
        worker_id: WorkerId,
        error: String,
    },
    /// Worker-detected fault (e.g. resource exhaustion).
    Fault {
        worker_id: WorkerId,
        kind: FaultKind,
        detail: String,
    },
}

/// Launches and reaches worker instances.
///
/// Every method may perform I/O; callers never hold a store lock across them.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start an instance and return its dispatch channel.
    async fn launch(
        &self,
        instance: &WorkerInstance,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError>;

    /// Check that a launched instance is ready to accept work.
    async fn probe(&self, worker_id: &WorkerId) -> Result<(), BackendError>;

    /// Recreate the dispatch channel to a running instance.
    async fn reconnect(
        &self,
        worker_id: &WorkerId,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError>;

    /// Release backend resources for an instance.
    async fn shutdown(&self, worker_id: &WorkerId);
}
