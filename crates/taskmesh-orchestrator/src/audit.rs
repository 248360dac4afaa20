//! Append-only audit trail of faults and healing actions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use taskmesh_core::{AuditEntry, AuditKind, Fault, FaultKind};

/// Running totals derived from the trail, used by metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditCounts {
    pub faults_by_kind: BTreeMap<FaultKind, u64>,
    pub healed: u64,
    pub escalated: u64,
}

#[derive(Debug, Default)]
struct Trail {
    entries: Vec<AuditEntry>,
    faults: Vec<Fault>,
    counts: AuditCounts,
}

/// Append-only record. Sequence numbers start at 1 and `recorded_at` never
/// goes backwards.
#[derive(Debug, Default)]
pub struct AuditTrail {
    inner: Mutex<Trail>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Trail> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry stamped with the current time.
    pub fn record(&self, entry: AuditEntry) -> u64 {
        self.record_at(entry, Utc::now())
    }

    /// Append an entry stamped with `at` (clamped to the previous entry).
    pub fn record_at(&self, mut entry: AuditEntry, at: DateTime<Utc>) -> u64 {
        let mut trail = self.lock();
        let seq = trail.entries.len() as u64 + 1;
        let floor = trail.entries.last().map(|e| e.recorded_at);
        entry.seq = seq;
        entry.recorded_at = match floor {
            Some(prev) if prev > at => prev,
            _ => at,
        };
        match entry.kind {
            AuditKind::HealApplied => trail.counts.healed += 1,
            AuditKind::HealEscalated => trail.counts.escalated += 1,
            _ => {}
        }
        trail.entries.push(entry);
        seq
    }

    /// Record an observed fault; it also becomes visible through `faults()`.
    pub fn record_fault(&self, fault: &Fault, at: DateTime<Utc>) -> u64 {
        {
            let mut trail = self.lock();
            trail.faults.push(fault.clone());
            *trail.counts.faults_by_kind.entry(fault.kind).or_insert(0) += 1;
        }
        self.record_at(AuditEntry::fault_observed(fault), at)
    }

    /// Entries with `seq > after`.
    pub fn since(&self, after: u64) -> Vec<AuditEntry> {
        let trail = self.lock();
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(trail.entries.len());
        trail.entries[start..].to_vec()
    }

    /// Every fault recorded so far, in observation order.
    pub fn faults(&self) -> Vec<Fault> {
        self.lock().faults.clone()
    }

    pub fn counts(&self) -> AuditCounts {
        self.lock().counts.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::WorkerId;

    #[test]
    fn test_sequence_and_monotonic_time() {
        let trail = AuditTrail::new();
        let t0 = Utc::now();
        let fault = Fault::crash(WorkerId::new("w1"), t0);

        assert_eq!(trail.record_fault(&fault, t0), 1);
        // An earlier clock reading is clamped.
        let seq = trail.record_at(
            AuditEntry::heal_applied(&fault, "replaced"),
            t0 - chrono::Duration::seconds(5),
        );
        assert_eq!(seq, 2);

        let entries = trail.since(0);
        assert_eq!(entries.len(), 2);
        assert!(entries[1].recorded_at >= entries[0].recorded_at);
        assert_eq!(trail.since(1).len(), 1);
        assert!(trail.since(10).is_empty());
    }

    #[test]
    fn test_counts_track_kinds_and_outcomes() {
        let trail = AuditTrail::new();
        let at = Utc::now();
        let fault = Fault::timeout(at).for_worker(WorkerId::new("w1"));

        trail.record_fault(&fault, at);
        trail.record(AuditEntry::heal_escalated(&fault, "gave up"));

        let counts = trail.counts();
        assert_eq!(counts.faults_by_kind.get(&FaultKind::Timeout), Some(&1));
        assert_eq!(counts.escalated, 1);
        assert_eq!(counts.healed, 0);
        assert_eq!(trail.faults().len(), 1);
    }
}
