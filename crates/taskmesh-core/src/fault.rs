//! Classified abnormal conditions that need a corrective action.

use crate::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of fault. Recovery dispatches on this with an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ConnectionFailure,
    ResourceExhaustion,
    Timeout,
    Crash,
    Unrecognized,
}

impl FaultKind {
    /// All kinds, in declaration order.
    pub const ALL: [FaultKind; 5] = [
        Self::ConnectionFailure,
        Self::ResourceExhaustion,
        Self::Timeout,
        Self::Crash,
        Self::Unrecognized,
    ];

    /// Lower sorts first when a batch of faults is ordered for healing.
    pub fn severity_rank(&self) -> u8 {
        match self {
            Self::Crash => 0,
            Self::Timeout => 1,
            Self::ConnectionFailure => 2,
            Self::ResourceExhaustion => 3,
            Self::Unrecognized => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailure => "connection_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified fault observed by a component or derived by diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Worker the fault is attributed to, if any.
    pub worker_id: Option<WorkerId>,
    /// Task the fault is attributed to, if any.
    pub task_id: Option<TaskId>,
    pub observed_at: DateTime<Utc>,
    /// Free-form details (ordered, so equal faults compare equal).
    pub context: BTreeMap<String, String>,
}

impl Fault {
    /// Create a fault with no subject.
    pub fn new(kind: FaultKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            worker_id: None,
            task_id: None,
            observed_at,
            context: BTreeMap::new(),
        }
    }

    /// Worker heartbeat or task progress deadline missed.
    pub fn timeout(observed_at: DateTime<Utc>) -> Self {
        Self::new(FaultKind::Timeout, observed_at)
    }

    /// Worker died (or was force-terminated) with work outstanding.
    pub fn crash(worker_id: WorkerId, observed_at: DateTime<Utc>) -> Self {
        Self::new(FaultKind::Crash, observed_at).for_worker(worker_id)
    }

    /// Dispatch channel to a worker is gone.
    pub fn connection_failure(worker_id: WorkerId, observed_at: DateTime<Utc>) -> Self {
        Self::new(FaultKind::ConnectionFailure, observed_at).for_worker(worker_id)
    }

    /// Builder method to attribute the fault to a worker.
    pub fn for_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Builder method to attribute the fault to a task.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Builder method to add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Stable identity of this fault occurrence.
    ///
    /// Two faults with the same kind, subject and observation time are the
    /// same occurrence; healing is cached under this key.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind,
            self.worker_id.as_ref().map(WorkerId::as_str).unwrap_or("-"),
            self.task_id.as_ref().map(TaskId::as_str).unwrap_or("-"),
            self.observed_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_context() {
        let at = Utc::now();
        let a = Fault::crash(WorkerId::new("w1"), at).with_context("reason", "oom");
        let b = Fault::crash(WorkerId::new("w1"), at).with_context("reason", "segfault");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_subject_and_time() {
        let at = Utc::now();
        let base = Fault::timeout(at).for_worker(WorkerId::new("w1"));

        let other_worker = Fault::timeout(at).for_worker(WorkerId::new("w2"));
        let later = Fault::timeout(at + chrono::Duration::milliseconds(1))
            .for_worker(WorkerId::new("w1"));
        let with_task = base.clone().for_task(TaskId::new("t1"));

        assert_ne!(base.fingerprint(), other_worker.fingerprint());
        assert_ne!(base.fingerprint(), later.fingerprint());
        assert_ne!(base.fingerprint(), with_task.fingerprint());
    }

    #[test]
    fn test_crash_ranks_before_everything() {
        let min = FaultKind::ALL
            .into_iter()
            .min_by_key(FaultKind::severity_rank);
        assert_eq!(min, Some(FaultKind::Crash));
        assert!(FaultKind::Unrecognized.severity_rank() > FaultKind::Timeout.severity_rank());
    }
}
