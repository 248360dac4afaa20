//! Result contribution and aggregation types.

use crate::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One worker's contribution to a task, unique per (task, worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub result: String,
    pub received_at: DateTime<Utc>,
}

/// The merged answer for a task. Written once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub task_id: TaskId,
    pub contribution_count: u32,
    pub merged_result: String,
    pub completed_at: DateTime<Utc>,
}
