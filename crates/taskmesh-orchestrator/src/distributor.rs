//! Task distributor - places tasks on the least-loaded Active worker.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use taskmesh_core::{
    AuditEntry, CoreError, Fault, Task, TaskAssignment, TaskId, TaskStatus, WorkerId, WorkerState,
};

use crate::audit::AuditTrail;
use crate::backend::WorkerCommand;
use crate::faults::FaultInbox;
use crate::state::{self, DispatchFailure, Stores, TaskEntry, TaskMap, WorkerEntry, WorkerMap};

/// Distribution errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributeError {
    #[error("No active worker available for task {0}")]
    NoCapacity(TaskId),

    #[error("Task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// What the aggregation needs after a contribution arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// The aggregation completed; the task is done.
    Finished,
    /// More distinct contributions are required.
    NeedsMore,
}

/// Result of moving a lost worker's tasks elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reassignment {
    pub reassigned: Vec<TaskAssignment>,
    /// Tasks left Queued for lack of an eligible worker.
    pub queued: Vec<TaskId>,
}

type Dispatch = (TaskAssignment, Result<(), DispatchFailure>);

/// Task distributor.
#[derive(Clone)]
pub struct TaskDistributor {
    stores: Arc<Stores>,
    inbox: Arc<FaultInbox>,
    audit: Arc<AuditTrail>,
}

impl TaskDistributor {
    pub fn new(stores: Arc<Stores>, inbox: Arc<FaultInbox>, audit: Arc<AuditTrail>) -> Self {
        Self {
            stores,
            inbox,
            audit,
        }
    }

    /// Assign a new task to the Active worker with the lowest load.
    ///
    /// Fails with `NoCapacity` when no worker is Active; the task is then not
    /// retained.
    pub fn submit(&self, task: Task) -> Result<TaskAssignment, DistributeError> {
        task.validate()?;
        let now = Utc::now();

        let (assignment, dispatch) = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            if tasks.contains(&task.id) {
                return Err(DistributeError::DuplicateTask(task.id));
            }
            let worker_id = workers
                .select_least_loaded(&BTreeSet::new())
                .ok_or_else(|| DistributeError::NoCapacity(task.id.clone()))?;

            let mut entry = TaskEntry::new(task);
            entry.task.status = TaskStatus::Queued;
            let assignment = state::bind(&mut workers, &mut entry, &worker_id, now)
                .ok_or_else(|| DistributeError::NoCapacity(entry.task.id.clone()))?;
            let dispatch =
                dispatch_execute(workers.get(&worker_id), &assignment, &entry.task.payload);
            tasks.insert(entry);
            (assignment, dispatch)
        };

        info!(
            task_id = %assignment.task_id,
            worker_id = %assignment.worker_id,
            "Task assigned"
        );
        self.report_dispatch(&assignment, dispatch, now);
        Ok(assignment)
    }

    /// Handle a contribution reported by `worker_id`.
    ///
    /// Releases that worker's assignment. `Finished` completes the task and
    /// cancels any other live assignment; `NeedsMore` re-queues it and places
    /// it on a worker that has not contributed yet. Returns the new placement.
    pub fn on_completion(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        next: Continuation,
    ) -> Result<Option<TaskAssignment>, DistributeError> {
        let now = Utc::now();
        let mut drained = Vec::new();

        let placed = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            let Some(entry) = tasks.get_mut(task_id) else {
                return self.missing(&tasks, task_id).map(|_| None);
            };

            if entry.assigned_to() == Some(worker_id) {
                state::release(&mut workers, entry);
                drained.extend(finish_drain(&mut workers, worker_id, now));
            }
            entry.contributors.insert(worker_id.clone());

            match next {
                Continuation::Finished => {
                    if let Some(other) = state::release(&mut workers, entry) {
                        let cancel = WorkerCommand::Cancel {
                            task_id: task_id.clone(),
                        };
                        if let Some(holder) = workers.get(&other.worker_id) {
                            let _ = holder.try_dispatch(cancel);
                        }
                        drained.extend(finish_drain(&mut workers, &other.worker_id, now));
                    }
                    entry.task.status = TaskStatus::Completed;
                    tasks.archive(task_id);
                    None
                }
                Continuation::NeedsMore => {
                    if entry.assignment.is_none() {
                        entry.task.status = TaskStatus::Queued;
                        place(&mut workers, &mut tasks, task_id, now)
                    } else {
                        None
                    }
                }
            }
        };

        self.finish_drains(drained, now);
        debug!(task_id = %task_id, worker_id = %worker_id, next = ?next, "Completion handled");
        Ok(placed.map(|(assignment, dispatch)| {
            self.report_dispatch(&assignment, dispatch, now);
            assignment
        }))
    }

    /// Mark a task Failed after its assignee reported an error.
    ///
    /// Never retries. Reports from workers that no longer hold the task are
    /// ignored.
    pub fn on_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        reason: &str,
    ) -> Result<(), DistributeError> {
        let now = Utc::now();
        let drained = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            let Some(entry) = tasks.get_mut(task_id) else {
                return self.missing(&tasks, task_id);
            };
            if entry.assigned_to() != Some(worker_id) {
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    "Ignoring failure from worker that does not hold the task"
                );
                return Ok(());
            }
            state::release(&mut workers, entry);
            entry.task.status = TaskStatus::Failed;
            entry.task.failure_reason = Some(reason.to_string());
            tasks.archive(task_id);
            finish_drain(&mut workers, worker_id, now)
        };

        warn!(task_id = %task_id, worker_id = %worker_id, reason = %reason, "Task failed");
        self.finish_drains(drained.into_iter().collect(), now);
        Ok(())
    }

    /// Fail a live task on the orchestrator's own initiative.
    ///
    /// Returns false when the task was already terminal.
    pub fn fail_task(&self, task_id: &TaskId, reason: &str) -> Result<bool, DistributeError> {
        let now = Utc::now();
        let drained = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            let Some(entry) = tasks.get_mut(task_id) else {
                return self.missing(&tasks, task_id).map(|_| false);
            };
            let mut drained = None;
            if let Some(released) = state::release(&mut workers, entry) {
                if let Some(holder) = workers.get(&released.worker_id) {
                    let _ = holder.try_dispatch(WorkerCommand::Cancel {
                        task_id: task_id.clone(),
                    });
                }
                drained = finish_drain(&mut workers, &released.worker_id, now);
            }
            entry.task.status = TaskStatus::Failed;
            entry.task.failure_reason = Some(reason.to_string());
            tasks.archive(task_id);
            drained
        };

        warn!(task_id = %task_id, reason = %reason, "Task failed by orchestrator");
        self.finish_drains(drained.into_iter().collect(), now);
        Ok(true)
    }

    /// Place Queued tasks on Active workers, highest priority first.
    ///
    /// Never moves a task that is already assigned.
    pub fn rebalance(&self) -> Vec<TaskAssignment> {
        let now = Utc::now();
        let placed: Vec<Dispatch> = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            if workers.count_in(WorkerState::Active) == 0 {
                return Vec::new();
            }
            tasks
                .queued_by_priority()
                .iter()
                .filter_map(|task_id| place(&mut workers, &mut tasks, task_id, now))
                .collect()
        };

        if !placed.is_empty() {
            info!(placed = placed.len(), "Rebalanced queued tasks");
        }
        placed
            .into_iter()
            .map(|(assignment, dispatch)| {
                self.report_dispatch(&assignment, dispatch, now);
                assignment
            })
            .collect()
    }

    /// Move tasks held by or released from a lost worker to Active workers.
    ///
    /// A worker that is still Active or Draining keeps its tasks.
    pub fn reassign_orphans(&self, worker_id: &WorkerId) -> Reassignment {
        let now = Utc::now();
        let (placed, queued) = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            let live = workers.get(worker_id).is_some_and(|e| {
                matches!(
                    e.instance.state,
                    WorkerState::Active | WorkerState::Draining
                )
            });
            if live {
                return Reassignment::default();
            }

            for task_id in tasks.assigned_to(worker_id) {
                if let Some(entry) = tasks.get_mut(&task_id) {
                    state::release(&mut workers, entry);
                    entry.task.status = TaskStatus::Queued;
                    entry.orphaned_from = Some(worker_id.clone());
                }
            }

            let mut placed = Vec::new();
            let mut queued = Vec::new();
            for task_id in tasks.orphaned_from(worker_id) {
                match place(&mut workers, &mut tasks, &task_id, now) {
                    Some(dispatch) => placed.push(dispatch),
                    None => queued.push(task_id),
                }
            }
            (placed, queued)
        };

        let reassigned: Vec<TaskAssignment> = placed
            .into_iter()
            .map(|(assignment, dispatch)| {
                self.report_dispatch(&assignment, dispatch, now);
                assignment
            })
            .collect();
        info!(
            worker_id = %worker_id,
            reassigned = reassigned.len(),
            queued = queued.len(),
            "Orphaned tasks reassigned"
        );
        Reassignment { reassigned, queued }
    }

    /// Resend every assignment a worker holds over its current channel.
    ///
    /// Returns how many sends succeeded.
    pub fn redeliver(&self, worker_id: &WorkerId) -> usize {
        let workers = self.stores.workers();
        let tasks = self.stores.tasks();
        let Some(worker) = workers.get(worker_id) else {
            return 0;
        };
        tasks
            .assigned_to(worker_id)
            .iter()
            .filter_map(|task_id| tasks.get(task_id))
            .filter_map(|entry| entry.assignment.as_ref().map(|a| (a, &entry.task.payload)))
            .filter(|(assignment, payload)| {
                dispatch_execute(Some(worker), assignment, payload).is_ok()
            })
            .count()
    }

    /// Fail the lowest-priority Queued tasks until at most `limit` remain.
    pub fn shed_queued(&self, limit: usize) -> Vec<TaskId> {
        let shed: Vec<TaskId> = {
            let mut tasks = self.stores.tasks_mut();
            let queued = tasks.queued_by_priority();
            if queued.len() <= limit {
                return Vec::new();
            }
            let shed = queued[limit..].to_vec();
            for task_id in &shed {
                if let Some(entry) = tasks.get_mut(task_id) {
                    entry.task.status = TaskStatus::Failed;
                    entry.task.failure_reason = Some("shed: queue over limit".to_string());
                }
                tasks.archive(task_id);
            }
            shed
        };
        warn!(shed = shed.len(), limit, "Shed queued tasks");
        shed
    }

    /// Look up a task, live or archived.
    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        let tasks = self.stores.tasks();
        tasks
            .get(task_id)
            .map(|e| e.task.clone())
            .or_else(|| tasks.find_archived(task_id).cloned())
    }

    /// Live assignment of a task, if any.
    pub fn assignment(&self, task_id: &TaskId) -> Option<TaskAssignment> {
        self.stores.tasks().get(task_id)?.assignment.clone()
    }

    /// Live (non-archived) tasks, sorted by id.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut list: Vec<Task> = self
            .stores
            .tasks()
            .values()
            .map(|e| e.task.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn missing(&self, tasks: &TaskMap, task_id: &TaskId) -> Result<(), DistributeError> {
        if tasks.find_archived(task_id).is_some() {
            debug!(task_id = %task_id, "Report for finished task ignored");
            return Ok(());
        }
        Err(DistributeError::TaskNotFound(task_id.clone()))
    }

    fn report_dispatch(
        &self,
        assignment: &TaskAssignment,
        dispatch: Result<(), DispatchFailure>,
        now: DateTime<Utc>,
    ) {
        if let Err(failure) = dispatch {
            warn!(
                task_id = %assignment.task_id,
                worker_id = %assignment.worker_id,
                reason = failure.as_str(),
                "Dispatch failed, assignment kept for redelivery"
            );
            self.inbox.push(
                Fault::connection_failure(assignment.worker_id.clone(), now)
                    .for_task(assignment.task_id.clone())
                    .with_context("reason", failure.as_str()),
            );
        }
    }

    fn finish_drains(&self, drained: Vec<WorkerEntry>, now: DateTime<Utc>) {
        for entry in drained {
            let worker_id = entry.instance.id.clone();
            self.audit.record_at(
                AuditEntry::worker_state_changed(
                    worker_id.clone(),
                    WorkerState::Draining,
                    WorkerState::Terminated,
                    Some("drained"),
                ),
                now,
            );
            let _ = entry.try_dispatch(WorkerCommand::Shutdown { force: false });
            info!(worker_id = %worker_id, "Worker drained and terminated");
        }
    }
}

/// Place one Queued task on the best eligible worker.
fn place(
    workers: &mut WorkerMap,
    tasks: &mut TaskMap,
    task_id: &TaskId,
    now: DateTime<Utc>,
) -> Option<Dispatch> {
    let entry = tasks.get_mut(task_id)?;
    if entry.task.status != TaskStatus::Queued {
        return None;
    }
    let worker_id = workers.select_least_loaded(&entry.contributors)?;
    let assignment = state::bind(workers, entry, &worker_id, now)?;
    let dispatch = dispatch_execute(workers.get(&worker_id), &assignment, &entry.task.payload);
    Some((assignment, dispatch))
}

fn dispatch_execute(
    worker: Option<&WorkerEntry>,
    assignment: &TaskAssignment,
    payload: &str,
) -> Result<(), DispatchFailure> {
    let worker = worker.ok_or(DispatchFailure::NotConnected)?;
    worker.try_dispatch(WorkerCommand::Execute {
        assignment: assignment.clone(),
        payload: payload.to_string(),
    })
}

/// Retire a Draining worker whose last assignment just went away.
fn finish_drain(
    workers: &mut WorkerMap,
    worker_id: &WorkerId,
    now: DateTime<Utc>,
) -> Option<WorkerEntry> {
    let idle_draining = workers
        .get(worker_id)
        .is_some_and(|e| e.instance.state == WorkerState::Draining && e.instance.load == 0);
    if idle_draining {
        workers.retire(worker_id, now)
    } else {
        None
    }
}
