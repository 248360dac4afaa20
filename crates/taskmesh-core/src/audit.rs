//! Audit entries for the append-only orchestration trail.

use crate::{Fault, TaskId, WorkerId, WorkerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One record in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, assigned on append (0 until then).
    pub seq: u64,
    /// When the entry was recorded. Non-decreasing along the trail.
    pub recorded_at: DateTime<Utc>,
    /// Type of entry.
    pub kind: AuditKind,
    /// Worker the entry concerns, if any.
    pub worker_id: Option<WorkerId>,
    /// Task the entry concerns, if any.
    pub task_id: Option<TaskId>,
    /// Entry-specific metadata (fault kind, action, reason, ...).
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    /// Create a new, unsequenced entry.
    pub fn new(kind: AuditKind, metadata: BTreeMap<String, String>) -> Self {
        Self {
            seq: 0,
            recorded_at: Utc::now(),
            kind,
            worker_id: None,
            task_id: None,
            metadata,
        }
    }

    /// Create a WorkerSpawned entry.
    pub fn worker_spawned(worker_id: WorkerId, kind: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("worker_kind".to_string(), kind.to_string());
        let mut entry = Self::new(AuditKind::WorkerSpawned, metadata);
        entry.worker_id = Some(worker_id);
        entry
    }

    /// Create a WorkerStateChanged entry.
    pub fn worker_state_changed(
        worker_id: WorkerId,
        from: WorkerState,
        to: WorkerState,
        reason: Option<&str>,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("from".to_string(), from.to_string());
        metadata.insert("to".to_string(), to.to_string());
        if let Some(r) = reason {
            metadata.insert("reason".to_string(), r.to_string());
        }
        let mut entry = Self::new(AuditKind::WorkerStateChanged, metadata);
        entry.worker_id = Some(worker_id);
        entry
    }

    /// Create a FaultObserved entry carrying the fault's context.
    pub fn fault_observed(fault: &Fault) -> Self {
        let mut metadata = fault.context.clone();
        metadata.insert("fault_kind".to_string(), fault.kind.to_string());
        metadata.insert("fingerprint".to_string(), fault.fingerprint());
        metadata.insert("observed_at".to_string(), fault.observed_at.to_rfc3339());
        let mut entry = Self::new(AuditKind::FaultObserved, metadata);
        entry.worker_id = fault.worker_id.clone();
        entry.task_id = fault.task_id.clone();
        entry
    }

    /// Create a HealApplied entry.
    pub fn heal_applied(fault: &Fault, action: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("fault_kind".to_string(), fault.kind.to_string());
        metadata.insert("fingerprint".to_string(), fault.fingerprint());
        metadata.insert("action".to_string(), action.to_string());
        let mut entry = Self::new(AuditKind::HealApplied, metadata);
        entry.worker_id = fault.worker_id.clone();
        entry.task_id = fault.task_id.clone();
        entry
    }

    /// Create a HealEscalated entry.
    pub fn heal_escalated(fault: &Fault, reason: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("fault_kind".to_string(), fault.kind.to_string());
        metadata.insert("fingerprint".to_string(), fault.fingerprint());
        metadata.insert("reason".to_string(), reason.to_string());
        let mut entry = Self::new(AuditKind::HealEscalated, metadata);
        entry.worker_id = fault.worker_id.clone();
        entry.task_id = fault.task_id.clone();
        entry
    }
}

/// Type of audit entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A worker instance was launched.
    WorkerSpawned,
    /// A worker instance changed lifecycle state.
    WorkerStateChanged,
    /// A fault entered a supervision batch.
    FaultObserved,
    /// Recovery handled a fault.
    HealApplied,
    /// Recovery could not handle a fault.
    HealEscalated,
}
