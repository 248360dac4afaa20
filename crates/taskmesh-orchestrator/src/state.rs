//! Shared orchestration state.
//!
//! Three stores, each behind its own `RwLock`:
//!
//! 1. worker table ([`WorkerMap`])
//! 2. task/assignment table ([`TaskMap`])
//! 3. result table ([`ResultMap`])
//!
//! Code that needs more than one store acquires them in exactly that order.
//! Guards are never held across an `.await`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use taskmesh_core::{
    AggregatedResult, ResultRecord, Task, TaskAssignment, TaskId, TaskStatus, WorkerId,
    WorkerInstance, WorkerState,
};

use crate::backend::WorkerCommand;

/// How many terminated instances stay resolvable after leaving the table.
const RETIRED_CAPACITY: usize = 256;

/// How many finished tasks stay resolvable after leaving the live table.
const ARCHIVE_CAPACITY: usize = 4096;

// ============================================================================
// Worker table
// ============================================================================

/// A worker instance plus its orchestrator-side bookkeeping.
#[derive(Debug)]
pub struct WorkerEntry {
    /// Domain view of the instance.
    pub instance: WorkerInstance,

    /// Dispatch channel to this worker, once launched.
    pub tx: Option<mpsc::Sender<WorkerCommand>>,

    /// Extended deadline granted by recovery after a Timeout.
    pub deadline_extension: Option<DateTime<Utc>>,
}

impl WorkerEntry {
    pub fn new(instance: WorkerInstance) -> Self {
        Self {
            instance,
            tx: None,
            deadline_extension: None,
        }
    }

    /// Later of the heartbeat deadline and any granted extension.
    pub fn effective_deadline(&self, timeout: chrono::Duration) -> DateTime<Utc> {
        let deadline = self.instance.heartbeat_deadline(timeout);
        match self.deadline_extension {
            Some(extended) if extended > deadline => extended,
            _ => deadline,
        }
    }

    /// Whether the dispatch channel exists and is still open.
    pub fn connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Non-blocking send on the dispatch channel.
    pub fn try_dispatch(&self, command: WorkerCommand) -> Result<(), DispatchFailure> {
        let tx = self.tx.as_ref().ok_or(DispatchFailure::NotConnected)?;
        tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => DispatchFailure::Full,
            TrySendError::Closed(_) => DispatchFailure::Closed,
        })
    }
}

/// Why a dispatch did not reach the worker's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchFailure {
    NotConnected,
    Full,
    Closed,
}

impl DispatchFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Full => "channel_full",
            Self::Closed => "channel_closed",
        }
    }
}

/// The worker table.
#[derive(Debug, Default)]
pub struct WorkerMap {
    entries: HashMap<WorkerId, WorkerEntry>,
    retired: VecDeque<WorkerInstance>,
}

impl WorkerMap {
    pub fn get(&self, id: &WorkerId) -> Option<&WorkerEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerEntry> {
        self.entries.get_mut(id)
    }

    pub fn insert(&mut self, entry: WorkerEntry) {
        self.entries.insert(entry.instance.id.clone(), entry);
    }

    pub fn values(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut WorkerEntry> {
        self.entries.values_mut()
    }

    /// Starting + Active instances.
    pub fn capacity_in_use(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.instance.state.counts_toward_capacity())
            .count()
    }

    pub fn count_in(&self, state: WorkerState) -> usize {
        self.entries
            .values()
            .filter(|e| e.instance.state == state)
            .count()
    }

    /// Move a Draining instance to Terminated and out of the table.
    ///
    /// Returns the removed entry so the caller can close its channel.
    pub fn retire(&mut self, id: &WorkerId, at: DateTime<Utc>) -> Option<WorkerEntry> {
        let entry = self.entries.get_mut(id)?;
        if entry.instance.transition(WorkerState::Terminated, at).is_err() {
            return None;
        }
        let entry = self.entries.remove(id)?;
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(entry.instance.clone());
        Some(entry)
    }

    /// Drop an entry outright (purging Failed instances).
    pub fn remove(&mut self, id: &WorkerId) -> Option<WorkerEntry> {
        self.entries.remove(id)
    }

    pub fn find_retired(&self, id: &WorkerId) -> Option<&WorkerInstance> {
        self.retired.iter().rev().find(|w| &w.id == id)
    }

    /// Least-connections choice among Active workers.
    ///
    /// Minimum load wins; ties go to the earliest heartbeat, then the
    /// smallest id, so the choice is deterministic.
    pub fn select_least_loaded(&self, exclude: &BTreeSet<WorkerId>) -> Option<WorkerId> {
        self.entries
            .values()
            .filter(|e| e.instance.state.accepts_assignments())
            .filter(|e| !exclude.contains(&e.instance.id))
            .min_by(|a, b| {
                (a.instance.load, a.instance.last_heartbeat, &a.instance.id).cmp(&(
                    b.instance.load,
                    b.instance.last_heartbeat,
                    &b.instance.id,
                ))
            })
            .map(|e| e.instance.id.clone())
    }
}

// ============================================================================
// Task table
// ============================================================================

/// A live task plus its assignment bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task: Task,

    /// The single live assignment, if any.
    pub assignment: Option<TaskAssignment>,

    /// Placements so far.
    pub attempts: u32,

    /// Workers that already completed an attempt (never chosen again).
    pub contributors: BTreeSet<WorkerId>,

    /// Worker this task was released from by a force-termination.
    pub orphaned_from: Option<WorkerId>,
}

impl TaskEntry {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            assignment: None,
            attempts: 0,
            contributors: BTreeSet::new(),
            orphaned_from: None,
        }
    }

    pub fn assigned_to(&self) -> Option<&WorkerId> {
        self.assignment.as_ref().map(|a| &a.worker_id)
    }
}

/// The task/assignment table.
#[derive(Debug, Default)]
pub struct TaskMap {
    live: HashMap<TaskId, TaskEntry>,
    archive: HashMap<TaskId, Task>,
    archive_order: VecDeque<TaskId>,
}

impl TaskMap {
    pub fn get(&self, id: &TaskId) -> Option<&TaskEntry> {
        self.live.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskEntry> {
        self.live.get_mut(id)
    }

    pub fn insert(&mut self, entry: TaskEntry) {
        self.live.insert(entry.task.id.clone(), entry);
    }

    /// Known either live or archived.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.live.contains_key(id) || self.archive.contains_key(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &TaskEntry> {
        self.live.values()
    }

    pub fn find_archived(&self, id: &TaskId) -> Option<&Task> {
        self.archive.get(id)
    }

    /// Move a terminal task out of the live table.
    pub fn archive(&mut self, id: &TaskId) {
        let Some(entry) = self.live.remove(id) else {
            return;
        };
        if self.archive_order.len() == ARCHIVE_CAPACITY {
            if let Some(oldest) = self.archive_order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
        self.archive_order.push_back(id.clone());
        self.archive.insert(id.clone(), entry.task);
    }

    /// Tasks whose live assignment is held by `worker_id`, sorted by id.
    pub fn assigned_to(&self, worker_id: &WorkerId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .live
            .values()
            .filter(|e| e.assigned_to() == Some(worker_id))
            .map(|e| e.task.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Queued tasks released from `worker_id` by a force-termination.
    pub fn orphaned_from(&self, worker_id: &WorkerId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .live
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Queued && e.orphaned_from.as_ref() == Some(worker_id)
            })
            .map(|e| e.task.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Queued tasks in placement order: priority desc, oldest first.
    pub fn queued_by_priority(&self) -> Vec<TaskId> {
        let mut queued: Vec<&TaskEntry> = self
            .live
            .values()
            .filter(|e| e.task.status == TaskStatus::Queued)
            .collect();
        queued.sort_by(|a, b| {
            (Reverse(a.task.priority), a.task.submitted_at, &a.task.id).cmp(&(
                Reverse(b.task.priority),
                b.task.submitted_at,
                &b.task.id,
            ))
        });
        queued.into_iter().map(|e| e.task.id.clone()).collect()
    }

    pub fn count_in(&self, status: TaskStatus) -> usize {
        self.live.values().filter(|e| e.task.status == status).count()
            + self.archive.values().filter(|t| t.status == status).count()
    }
}

// ============================================================================
// Result table
// ============================================================================

/// Contributions collected so far for a task.
#[derive(Debug, Clone)]
pub struct PendingAggregation {
    pub expected: u32,
    pub opened_at: DateTime<Utc>,
    /// Last time this aggregation was reported stale.
    pub flagged_at: Option<DateTime<Utc>>,
    /// One record per contributing worker.
    pub records: BTreeMap<WorkerId, ResultRecord>,
}

impl PendingAggregation {
    pub fn new(expected: u32, opened_at: DateTime<Utc>) -> Self {
        Self {
            expected,
            opened_at,
            flagged_at: None,
            records: BTreeMap::new(),
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.records.len() >= self.expected as usize
    }
}

/// The result table.
#[derive(Debug, Default)]
pub struct ResultMap {
    pub pending: HashMap<TaskId, PendingAggregation>,
    pub completed: HashMap<TaskId, AggregatedResult>,
}

// ============================================================================
// Stores
// ============================================================================

/// The three shared stores, owned explicitly and passed by handle.
#[derive(Debug, Default)]
pub struct Stores {
    workers: RwLock<WorkerMap>,
    tasks: RwLock<TaskMap>,
    results: RwLock<ResultMap>,
}

impl Stores {
    /// Create empty stores wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn workers(&self) -> RwLockReadGuard<'_, WorkerMap> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn workers_mut(&self) -> RwLockWriteGuard<'_, WorkerMap> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tasks(&self) -> RwLockReadGuard<'_, TaskMap> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tasks_mut(&self) -> RwLockWriteGuard<'_, TaskMap> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn results(&self) -> RwLockReadGuard<'_, ResultMap> {
        self.results.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn results_mut(&self) -> RwLockWriteGuard<'_, ResultMap> {
        self.results.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Assignment bookkeeping shared by the components
// ============================================================================

/// Bind a task to a worker. The caller holds the worker and task write
/// guards and has already checked the worker is Active.
pub(crate) fn bind(
    workers: &mut WorkerMap,
    entry: &mut TaskEntry,
    worker_id: &WorkerId,
    now: DateTime<Utc>,
) -> Option<TaskAssignment> {
    let worker = workers.get_mut(worker_id)?;
    worker.instance.load += 1;
    entry.attempts += 1;
    let assignment = TaskAssignment {
        task_id: entry.task.id.clone(),
        worker_id: worker_id.clone(),
        assigned_at: now,
        attempt: entry.attempts,
    };
    entry.assignment = Some(assignment.clone());
    entry.orphaned_from = None;
    entry.task.status = TaskStatus::Assigned;
    Some(assignment)
}

/// Drop a task's live assignment and give the load back to its holder.
pub(crate) fn release(workers: &mut WorkerMap, entry: &mut TaskEntry) -> Option<TaskAssignment> {
    let assignment = entry.assignment.take()?;
    if let Some(worker) = workers.get_mut(&assignment.worker_id) {
        worker.instance.load = worker.instance.load.saturating_sub(1);
    }
    Some(assignment)
}
