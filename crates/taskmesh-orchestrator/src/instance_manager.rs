//! Worker instance lifecycle: spawn, drain, heartbeat and liveness.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use taskmesh_core::{
    AuditEntry, CoreError, Fault, TaskId, TaskStatus, WorkerId, WorkerInstance, WorkerState,
};

use crate::audit::AuditTrail;
use crate::backend::{BackendError, WorkerBackend, WorkerCommand};
use crate::config::Config;
use crate::faults::FaultInbox;
use crate::state::{self, Stores, WorkerEntry};

/// Spawn errors.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Capacity exceeded: {active} of {max} instances in use")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Worker {worker_id} failed readiness probe: {reason}")]
    ReadinessProbe { worker_id: WorkerId, reason: String },

    #[error(transparent)]
    Launch(#[from] BackendError),
}

/// Owns the worker table.
#[derive(Clone)]
pub struct InstanceManager {
    stores: Arc<Stores>,
    backend: Arc<dyn WorkerBackend>,
    inbox: Arc<FaultInbox>,
    audit: Arc<AuditTrail>,
    config: Arc<Config>,
}

impl InstanceManager {
    pub fn new(
        stores: Arc<Stores>,
        backend: Arc<dyn WorkerBackend>,
        inbox: Arc<FaultInbox>,
        audit: Arc<AuditTrail>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            stores,
            backend,
            inbox,
            audit,
            config,
        }
    }

    /// Start a worker instance and wait for it to become Active.
    ///
    /// The Starting slot is reserved before launch, so concurrent spawns can
    /// never exceed `max_instances`.
    pub async fn spawn(
        &self,
        kind: &str,
        worker_config: BTreeMap<String, String>,
    ) -> Result<WorkerId, SpawnError> {
        let instance = WorkerInstance::new(kind, worker_config);
        let worker_id = instance.id.clone();

        {
            let mut workers = self.stores.workers_mut();
            let in_use = workers.capacity_in_use();
            if in_use >= self.config.max_instances {
                warn!(
                    kind = %kind,
                    in_use,
                    max = self.config.max_instances,
                    "Spawn rejected: capacity exceeded"
                );
                return Err(SpawnError::CapacityExceeded {
                    active: in_use,
                    max: self.config.max_instances,
                });
            }
            workers.insert(WorkerEntry::new(instance.clone()));
        }
        self.audit
            .record(AuditEntry::worker_spawned(worker_id.clone(), kind));
        debug!(worker_id = %worker_id, kind = %kind, "Worker slot reserved");

        let tx = match self.backend.launch(&instance).await {
            Ok(tx) => tx,
            Err(e) => {
                self.fail_starting(&worker_id, &e.to_string());
                return Err(SpawnError::Launch(e));
            }
        };

        let probe = tokio::time::timeout(self.config.probe_timeout, self.backend.probe(&worker_id));
        let failure = match probe.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no answer within {:?}",
                self.config.probe_timeout
            )),
        };
        if let Some(reason) = failure {
            self.fail_starting(&worker_id, &reason);
            self.backend.shutdown(&worker_id).await;
            return Err(SpawnError::ReadinessProbe { worker_id, reason });
        }

        let now = Utc::now();
        let activated = {
            let mut workers = self.stores.workers_mut();
            match workers.get_mut(&worker_id) {
                Some(entry) => {
                    let ok = entry.instance.transition(WorkerState::Active, now).is_ok();
                    if ok {
                        entry.instance.last_heartbeat = now;
                        entry.tx = Some(tx);
                    }
                    ok
                }
                None => false,
            }
        };
        if !activated {
            self.backend.shutdown(&worker_id).await;
            return Err(SpawnError::ReadinessProbe {
                worker_id,
                reason: "instance left Starting during startup".to_string(),
            });
        }

        self.audit.record_at(
            AuditEntry::worker_state_changed(
                worker_id.clone(),
                WorkerState::Starting,
                WorkerState::Active,
                Some("readiness_probe_ok"),
            ),
            now,
        );
        info!(worker_id = %worker_id, kind = %kind, "Worker active");
        Ok(worker_id)
    }

    fn fail_starting(&self, worker_id: &WorkerId, reason: &str) {
        let now = Utc::now();
        let failed = {
            let mut workers = self.stores.workers_mut();
            workers
                .get_mut(worker_id)
                .is_some_and(|e| e.instance.transition(WorkerState::Failed, now).is_ok())
        };
        if failed {
            self.audit.record_at(
                AuditEntry::worker_state_changed(
                    worker_id.clone(),
                    WorkerState::Starting,
                    WorkerState::Failed,
                    Some(reason),
                ),
                now,
            );
        }
        warn!(worker_id = %worker_id, reason = %reason, "Worker failed to start");
    }

    /// Begin draining an Active worker.
    ///
    /// An idle worker terminates at once. Otherwise it terminates when its
    /// last assignment completes, or is forced when `grace_period` expires.
    pub async fn terminate(&self, worker_id: &WorkerId) -> Result<(), CoreError> {
        let now = Utc::now();
        let retired = {
            let mut workers = self.stores.workers_mut();
            let entry = workers
                .get_mut(worker_id)
                .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))?;
            if entry.instance.state != WorkerState::Active {
                return Err(CoreError::WorkerUnavailable {
                    worker: worker_id.to_string(),
                    state: entry.instance.state.to_string(),
                    operation: "terminate",
                });
            }
            entry.instance.transition(WorkerState::Draining, now)?;
            if entry.instance.load == 0 {
                workers.retire(worker_id, now)
            } else {
                None
            }
        };

        self.audit.record_at(
            AuditEntry::worker_state_changed(
                worker_id.clone(),
                WorkerState::Active,
                WorkerState::Draining,
                Some("terminate_requested"),
            ),
            now,
        );

        if let Some(entry) = retired {
            self.audit.record_at(
                AuditEntry::worker_state_changed(
                    worker_id.clone(),
                    WorkerState::Draining,
                    WorkerState::Terminated,
                    Some("idle"),
                ),
                now,
            );
            let _ = entry.try_dispatch(WorkerCommand::Shutdown { force: false });
            info!(worker_id = %worker_id, "Worker terminated");
            return Ok(());
        }

        info!(
            worker_id = %worker_id,
            grace = ?self.config.grace_period,
            "Worker draining"
        );
        let manager = self.clone();
        let id = worker_id.clone();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.force_terminate(&id, Utc::now()).await;
        });
        Ok(())
    }

    /// Terminate a still-Draining worker, releasing its in-flight tasks.
    ///
    /// Each released task goes back to Queued and is raised as a Crash fault
    /// carrying the worker and task ids. A worker that finished draining in
    /// the meantime is left alone.
    pub async fn force_terminate(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> Vec<TaskId> {
        let (released, retired) = {
            let mut workers = self.stores.workers_mut();
            let mut tasks = self.stores.tasks_mut();
            let draining = workers
                .get(worker_id)
                .is_some_and(|e| e.instance.state == WorkerState::Draining);
            if !draining {
                return Vec::new();
            }

            let released = tasks.assigned_to(worker_id);
            for task_id in &released {
                if let Some(entry) = tasks.get_mut(task_id) {
                    state::release(&mut workers, entry);
                    entry.task.status = TaskStatus::Queued;
                    entry.orphaned_from = Some(worker_id.clone());
                }
            }
            (released, workers.retire(worker_id, now))
        };

        self.audit.record_at(
            AuditEntry::worker_state_changed(
                worker_id.clone(),
                WorkerState::Draining,
                WorkerState::Terminated,
                Some("grace_period_expired"),
            ),
            now,
        );
        warn!(
            worker_id = %worker_id,
            released = released.len(),
            "Grace period expired, worker force-terminated"
        );

        for task_id in &released {
            self.inbox.push(
                Fault::crash(worker_id.clone(), now)
                    .for_task(task_id.clone())
                    .with_context("reason", "grace_period_expired"),
            );
        }

        if let Some(entry) = retired {
            let _ = entry.try_dispatch(WorkerCommand::Shutdown { force: true });
        }
        self.backend.shutdown(worker_id).await;
        released
    }

    /// Record a heartbeat now.
    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), CoreError> {
        self.heartbeat_at(worker_id, Utc::now())
    }

    /// Record a heartbeat observed at `at`. Clears any deadline extension.
    pub fn heartbeat_at(&self, worker_id: &WorkerId, at: DateTime<Utc>) -> Result<(), CoreError> {
        let mut workers = self.stores.workers_mut();
        let Some(entry) = workers.get_mut(worker_id) else {
            if workers.find_retired(worker_id).is_some() {
                return Err(CoreError::WorkerUnavailable {
                    worker: worker_id.to_string(),
                    state: WorkerState::Terminated.to_string(),
                    operation: "heartbeat",
                });
            }
            return Err(CoreError::WorkerNotFound(worker_id.to_string()));
        };
        if entry.instance.state.is_terminal() {
            return Err(CoreError::WorkerUnavailable {
                worker: worker_id.to_string(),
                state: entry.instance.state.to_string(),
                operation: "heartbeat",
            });
        }
        if at > entry.instance.last_heartbeat {
            entry.instance.last_heartbeat = at;
        }
        entry.deadline_extension = None;
        Ok(())
    }

    /// Fail every Active worker silent past its deadline.
    ///
    /// Assignments stay bound to the failed worker until recovery acts on the
    /// raised Timeout. Returns the newly failed ids.
    pub fn check_liveness(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let timeout = self.config.heartbeat_timeout_delta();
        let mut failed = Vec::new();
        {
            let mut workers = self.stores.workers_mut();
            let tasks = self.stores.tasks();
            for entry in workers.values_mut() {
                if entry.instance.state != WorkerState::Active {
                    continue;
                }
                if now <= entry.effective_deadline(timeout) {
                    continue;
                }
                if entry.instance.transition(WorkerState::Failed, now).is_err() {
                    continue;
                }
                let id = entry.instance.id.clone();
                let in_flight = tasks.assigned_to(&id);
                failed.push((id, in_flight, entry.instance.last_heartbeat));
            }
        }
        failed.sort_by(|a, b| a.0.cmp(&b.0));

        for (worker_id, in_flight, last_heartbeat) in &failed {
            self.audit.record_at(
                AuditEntry::worker_state_changed(
                    worker_id.clone(),
                    WorkerState::Active,
                    WorkerState::Failed,
                    Some("heartbeat_timeout"),
                ),
                now,
            );
            let tasks: Vec<&str> = in_flight.iter().map(TaskId::as_str).collect();
            self.inbox.push(
                Fault::timeout(now)
                    .for_worker(worker_id.clone())
                    .with_context("tasks", tasks.join(","))
                    .with_context("last_heartbeat", last_heartbeat.to_rfc3339()),
            );
        }
        failed.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Grant a later deadline to an Active or Failed worker.
    pub fn extend_deadline(
        &self,
        worker_id: &WorkerId,
        until: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut workers = self.stores.workers_mut();
        let entry = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))?;
        match entry.instance.state {
            WorkerState::Active | WorkerState::Failed => {
                entry.deadline_extension = Some(until);
                Ok(())
            }
            other => Err(CoreError::WorkerUnavailable {
                worker: worker_id.to_string(),
                state: other.to_string(),
                operation: "extend its deadline",
            }),
        }
    }

    /// Mark a live worker Failed. Returns false when it already was.
    pub fn mark_failed(
        &self,
        worker_id: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let from = {
            let mut workers = self.stores.workers_mut();
            let entry = workers
                .get_mut(worker_id)
                .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))?;
            let from = entry.instance.state;
            if from == WorkerState::Failed {
                return Ok(false);
            }
            entry.instance.transition(WorkerState::Failed, now)?;
            from
        };
        self.audit.record_at(
            AuditEntry::worker_state_changed(
                worker_id.clone(),
                from,
                WorkerState::Failed,
                Some(reason),
            ),
            now,
        );
        warn!(worker_id = %worker_id, reason = %reason, "Worker marked failed");
        Ok(true)
    }

    /// Drop a Failed worker that no longer holds assignments.
    pub async fn purge_failed(&self, worker_id: &WorkerId) -> Result<WorkerInstance, CoreError> {
        let removed = {
            let mut workers = self.stores.workers_mut();
            let entry = workers
                .get(worker_id)
                .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))?;
            if entry.instance.state != WorkerState::Failed || entry.instance.load > 0 {
                return Err(CoreError::WorkerUnavailable {
                    worker: worker_id.to_string(),
                    state: entry.instance.state.to_string(),
                    operation: "be purged",
                });
            }
            workers.remove(worker_id)
        };
        self.backend.shutdown(worker_id).await;
        removed
            .map(|e| e.instance)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_string()))
    }

    /// Look up a worker, including recently terminated ones.
    pub fn describe(&self, worker_id: &WorkerId) -> Option<WorkerInstance> {
        let workers = self.stores.workers();
        workers
            .get(worker_id)
            .map(|e| e.instance.clone())
            .or_else(|| workers.find_retired(worker_id).cloned())
    }

    /// Workers currently in the table, sorted by id.
    pub fn list_workers(&self) -> Vec<WorkerInstance> {
        let mut list: Vec<WorkerInstance> = self
            .stores
            .workers()
            .values()
            .map(|e| e.instance.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Replace a worker's dispatch channel. Returns false if it is gone.
    pub fn attach_connection(&self, worker_id: &WorkerId, tx: mpsc::Sender<WorkerCommand>) -> bool {
        let mut workers = self.stores.workers_mut();
        match workers.get_mut(worker_id) {
            Some(entry) if !entry.instance.state.is_terminal() => {
                entry.tx = Some(tx);
                true
            }
            _ => false,
        }
    }

    /// `None` when the worker is unknown or terminal.
    pub fn connection_healthy(&self, worker_id: &WorkerId) -> Option<bool> {
        let workers = self.stores.workers();
        let entry = workers.get(worker_id)?;
        if entry.instance.state.is_terminal() {
            return None;
        }
        Some(entry.connected())
    }

    /// Whether the worker is still in the table, i.e. neither retired nor purged.
    pub fn is_tracked(&self, worker_id: &WorkerId) -> bool {
        self.stores.workers().get(worker_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.stores.workers().count_in(WorkerState::Active)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, test_config};
    use taskmesh_core::{FaultKind, Task};

    #[tokio::test]
    async fn test_spawn_activates_worker() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();

        let worker = h.manager.describe(&id).unwrap();
        assert_eq!(worker.state, WorkerState::Active);
        assert_eq!(worker.load, 0);
        assert_eq!(h.manager.connection_healthy(&id), Some(true));
    }

    #[tokio::test]
    async fn test_spawn_rejects_over_capacity() {
        let config = Config {
            max_instances: 2,
            ..test_config()
        };
        let h = harness(config);
        h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.manager.spawn("shard", BTreeMap::new()).await.unwrap();

        let err = h.manager.spawn("shard", BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, SpawnError::CapacityExceeded { active: 2, max: 2 }));
        assert_eq!(h.manager.list_workers().len(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_failed_record() {
        let h = harness(test_config());
        h.backend.fail_probes(true);

        let err = h.manager.spawn("shard", BTreeMap::new()).await.unwrap_err();
        let SpawnError::ReadinessProbe { worker_id, .. } = err else {
            panic!("expected probe failure, got {err:?}");
        };
        assert_eq!(h.manager.describe(&worker_id).unwrap().state, WorkerState::Failed);
        assert_eq!(h.backend.shutdowns(), vec![worker_id.clone()]);

        // A failed instance frees its slot.
        h.backend.fail_probes(false);
        let config_max = h.manager.config().max_instances;
        for _ in 0..config_max {
            h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_heartbeat_rejected_for_failed_and_unknown() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.manager.mark_failed(&id, "test", Utc::now()).unwrap();

        assert!(matches!(
            h.manager.heartbeat(&id),
            Err(CoreError::WorkerUnavailable { .. })
        ));
        assert!(matches!(
            h.manager.heartbeat(&WorkerId::new("ghost")),
            Err(CoreError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_liveness_fails_silent_worker_and_raises_timeout() {
        let h = harness(test_config());
        let quiet = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        let chatty = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        let t0 = Utc::now() + chrono::Duration::seconds(1);
        h.manager.heartbeat_at(&quiet, t0).unwrap();
        h.manager.heartbeat_at(&chatty, t0).unwrap();
        let assignment = h.distributor.submit(Task::new("{}")).unwrap();
        let holder = assignment.worker_id.clone();

        let later = t0 + chrono::Duration::seconds(6);
        let other = if holder == quiet { &chatty } else { &quiet };
        h.manager.heartbeat_at(other, later).unwrap();

        let failed = h.manager.check_liveness(later);
        assert_eq!(failed, vec![holder.clone()]);
        assert_eq!(h.manager.describe(&holder).unwrap().state, WorkerState::Failed);

        let faults = h.inbox.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Timeout);
        assert_eq!(faults[0].worker_id, Some(holder.clone()));
        assert_eq!(
            faults[0].context.get("tasks").map(String::as_str),
            Some(assignment.task_id.as_str())
        );

        // The assignment stays bound to the failed worker.
        let task = h.distributor.get_task(&assignment.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(h.manager.describe(&holder).unwrap().load, 1);
    }

    #[tokio::test]
    async fn test_extension_postpones_liveness_failure() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        let t0 = Utc::now() + chrono::Duration::seconds(1);
        h.manager.heartbeat_at(&id, t0).unwrap();
        h.manager
            .extend_deadline(&id, t0 + chrono::Duration::seconds(20))
            .unwrap();

        assert!(h.manager.check_liveness(t0 + chrono::Duration::seconds(10)).is_empty());
        assert_eq!(
            h.manager.check_liveness(t0 + chrono::Duration::seconds(21)),
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_idle_terminate_is_immediate() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();

        h.manager.terminate(&id).await.unwrap();

        assert!(h.manager.list_workers().is_empty());
        assert_eq!(h.manager.describe(&id).unwrap().state, WorkerState::Terminated);
        assert!(h
            .backend
            .drain_commands(&id)
            .contains(&WorkerCommand::Shutdown { force: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_releases_tasks_as_crash_faults() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        let first = h.distributor.submit(Task::new("{}")).unwrap();
        let second = h.distributor.submit(Task::new("{}")).unwrap();

        h.manager.terminate(&id).await.unwrap();
        assert_eq!(h.manager.describe(&id).unwrap().state, WorkerState::Draining);

        let past_grace = h.manager.config().grace_period + std::time::Duration::from_millis(10);
        tokio::time::sleep(past_grace).await;
        tokio::task::yield_now().await;

        assert_eq!(h.manager.describe(&id).unwrap().state, WorkerState::Terminated);
        for task_id in [&first.task_id, &second.task_id] {
            assert_eq!(h.distributor.get_task(task_id).unwrap().status, TaskStatus::Queued);
        }
        let faults = h.inbox.drain();
        assert_eq!(faults.len(), 2);
        assert!(faults
            .iter()
            .all(|f| f.kind == FaultKind::Crash && f.worker_id.as_ref() == Some(&id)));
        assert!(faults.iter().all(|f| f.task_id.is_some()));
    }

    #[tokio::test]
    async fn test_terminate_requires_active() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.manager.mark_failed(&id, "test", Utc::now()).unwrap();

        assert!(matches!(
            h.manager.terminate(&id).await,
            Err(CoreError::WorkerUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_requires_idle_failed_worker() {
        let h = harness(test_config());
        let id = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        assert!(h.manager.purge_failed(&id).await.is_err());

        h.manager.mark_failed(&id, "test", Utc::now()).unwrap();
        let purged = h.manager.purge_failed(&id).await.unwrap();
        assert_eq!(purged.state, WorkerState::Failed);
        assert!(h.manager.describe(&id).is_none());
    }
}
