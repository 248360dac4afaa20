//! Worker instance types.

use crate::{CoreError, WorkerId, WorkerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of execution capacity tracked by the instance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    /// Unique worker identifier.
    pub id: WorkerId,

    /// Kind of worker (selects what the backend launches).
    pub kind: String,

    /// Launch configuration handed to the backend.
    pub config: BTreeMap<String, String>,

    /// Current lifecycle state.
    pub state: WorkerState,

    /// Number of assignments currently outstanding on this worker.
    pub load: u32,

    /// Timestamp of the last accepted heartbeat.
    pub last_heartbeat: DateTime<Utc>,

    /// When the instance was spawned.
    pub spawned_at: DateTime<Utc>,

    /// When `state` last changed.
    pub state_changed_at: DateTime<Utc>,
}

impl WorkerInstance {
    /// Create a new instance in `Starting`.
    pub fn new(kind: impl Into<String>, config: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::generate(),
            kind: kind.into(),
            config,
            state: WorkerState::Starting,
            load: 0,
            last_heartbeat: now,
            spawned_at: now,
            state_changed_at: now,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    pub fn transition(&mut self, next: WorkerState, at: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.state_changed_at = at;
        Ok(())
    }

    /// Time after which the instance counts as silent.
    pub fn heartbeat_deadline(&self, timeout: chrono::Duration) -> DateTime<Utc> {
        self.last_heartbeat + timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_starts_unloaded() {
        let worker = WorkerInstance::new("shard", BTreeMap::new());
        assert_eq!(worker.state, WorkerState::Starting);
        assert_eq!(worker.load, 0);
        assert_eq!(worker.kind, "shard");
    }

    #[test]
    fn test_transition_updates_timestamp() {
        let mut worker = WorkerInstance::new("shard", BTreeMap::new());
        let later = worker.state_changed_at + chrono::Duration::seconds(3);

        worker.transition(WorkerState::Active, later).unwrap();

        assert_eq!(worker.state, WorkerState::Active);
        assert_eq!(worker.state_changed_at, later);
    }

    #[test]
    fn test_failed_instance_is_never_resurrected() {
        let mut worker = WorkerInstance::new("shard", BTreeMap::new());
        worker.transition(WorkerState::Failed, Utc::now()).unwrap();

        let err = worker.transition(WorkerState::Active, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(worker.state, WorkerState::Failed);
    }
}
