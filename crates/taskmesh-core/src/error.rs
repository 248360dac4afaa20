//! Core domain errors.

use thiserror::Error;

/// Core domain errors for TaskMesh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Worker not found.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Worker exists but is in a state that rejects the operation.
    #[error("Worker '{worker}' is {state} and cannot {operation}")]
    WorkerUnavailable {
        worker: String,
        state: String,
        operation: &'static str,
    },

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
