//! TaskMesh Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Network transports
//! - Storage
//!
//! Everything the orchestrator shares between its stores, its components and
//! its read-only accessors is defined here.

pub mod audit;
pub mod error;
pub mod fault;
pub mod ids;
pub mod result;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditKind};
pub use error::CoreError;
pub use fault::{Fault, FaultKind};
pub use ids::{TaskId, WorkerId};
pub use result::{AggregatedResult, ResultRecord};
pub use status::{TaskStatus, WorkerState};
pub use task::{Task, TaskAssignment};
pub use worker::WorkerInstance;
