//! Fault inbox.
//!
//! Components raise faults here between supervision cycles; `observe()`
//! drains it into the snapshot.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use taskmesh_core::Fault;

/// Queue of faults raised outside the supervision cycle.
#[derive(Debug, Default)]
pub struct FaultInbox {
    queue: Mutex<VecDeque<Fault>>,
}

impl FaultInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Fault>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise a fault.
    pub fn push(&self, fault: Fault) {
        warn!(
            kind = %fault.kind,
            worker_id = ?fault.worker_id.as_ref().map(|w| w.as_str()),
            task_id = ?fault.task_id.as_ref().map(|t| t.as_str()),
            "Fault raised"
        );
        self.lock().push_back(fault);
    }

    /// Take every queued fault in arrival order.
    pub fn drain(&self) -> Vec<Fault> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskmesh_core::WorkerId;

    #[test]
    fn test_drain_empties_in_order() {
        let inbox = FaultInbox::new();
        let at = Utc::now();
        inbox.push(Fault::crash(WorkerId::new("w1"), at));
        inbox.push(Fault::connection_failure(WorkerId::new("w2"), at));

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].worker_id, Some(WorkerId::new("w1")));
        assert!(inbox.is_empty());
    }
}
