//! Orchestrator facade.
//!
//! Wires the stores and components together and runs the background tasks:
//! the worker event pump, the liveness monitor and the supervision loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskmesh_core::{
    AggregatedResult, AuditEntry, CoreError, Fault, Task, TaskAssignment, TaskId, TaskStatus,
    WorkerId, WorkerInstance, WorkerState,
};

use crate::aggregator::{AggregationBacklog, CollectOutcome, ResultAggregator, ResultMerger};
use crate::audit::{AuditCounts, AuditTrail};
use crate::backend::{WorkerBackend, WorkerEvent};
use crate::config::{Config, ConfigError};
use crate::distributor::{Continuation, DistributeError, TaskDistributor};
use crate::faults::FaultInbox;
use crate::instance_manager::{InstanceManager, SpawnError};
use crate::recovery::RecoveryPolicy;
use crate::state::Stores;
use crate::supervision::{CycleReport, SupervisionLoop};

/// The orchestration core.
pub struct Orchestrator {
    config: Arc<Config>,
    stores: Arc<Stores>,
    inbox: Arc<FaultInbox>,
    audit: Arc<AuditTrail>,
    manager: InstanceManager,
    distributor: TaskDistributor,
    aggregator: ResultAggregator,
    supervision: Arc<SupervisionLoop>,
    stop: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator over `backend` with the default JSON merger.
    pub fn new(config: Config, backend: Arc<dyn WorkerBackend>) -> Result<Arc<Self>, ConfigError> {
        Self::with_merger(config, backend, None)
    }

    /// Build an orchestrator with a custom result merger.
    pub fn with_merger(
        config: Config,
        backend: Arc<dyn WorkerBackend>,
        merger: Option<Arc<dyn ResultMerger>>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let stores = Stores::new();
        let inbox = Arc::new(FaultInbox::new());
        let audit = Arc::new(AuditTrail::new());

        let manager = InstanceManager::new(
            stores.clone(),
            backend.clone(),
            inbox.clone(),
            audit.clone(),
            config.clone(),
        );
        let distributor = TaskDistributor::new(stores.clone(), inbox.clone(), audit.clone());
        let mut aggregator = ResultAggregator::new(stores.clone(), inbox.clone(), config.clone());
        if let Some(merger) = merger {
            aggregator = aggregator.with_merger(merger);
        }
        let recovery = Arc::new(RecoveryPolicy::new(
            manager.clone(),
            distributor.clone(),
            aggregator.clone(),
            backend,
            config.clone(),
        ));
        let supervision = Arc::new(SupervisionLoop::new(
            stores.clone(),
            inbox.clone(),
            audit.clone(),
            aggregator.clone(),
            distributor.clone(),
            recovery,
            config.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            stores,
            inbox,
            audit,
            manager,
            distributor,
            aggregator,
            supervision,
            stop: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Spawn a worker and place any queued tasks on the new capacity.
    pub async fn spawn_worker(
        &self,
        kind: &str,
        worker_config: BTreeMap<String, String>,
    ) -> Result<WorkerId, SpawnError> {
        let worker_id = self.manager.spawn(kind, worker_config).await?;
        self.distributor.rebalance();
        Ok(worker_id)
    }

    pub async fn terminate_worker(&self, worker_id: &WorkerId) -> Result<(), CoreError> {
        self.manager.terminate(worker_id).await?;
        self.distributor.rebalance();
        Ok(())
    }

    pub async fn purge_worker(&self, worker_id: &WorkerId) -> Result<WorkerInstance, CoreError> {
        self.manager.purge_failed(worker_id).await
    }

    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), CoreError> {
        self.manager.heartbeat(worker_id)
    }

    pub fn heartbeat_at(&self, worker_id: &WorkerId, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.manager.heartbeat_at(worker_id, at)
    }

    /// Fail silent workers. Returns the newly failed ids.
    pub fn check_liveness(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let failed = self.manager.check_liveness(now);
        if !failed.is_empty() {
            self.distributor.rebalance();
        }
        failed
    }

    // ------------------------------------------------------------------
    // Tasks and results
    // ------------------------------------------------------------------

    /// Submit a task. `NoCapacity` is returned when no worker is Active.
    ///
    /// A rejected submission leaves no aggregation behind, and a duplicate
    /// never disturbs the original's.
    pub fn submit(&self, task: Task) -> Result<TaskAssignment, DistributeError> {
        task.validate()?;
        let task_id = task.id.clone();
        let opened = self
            .aggregator
            .expect(&task_id, task.expected_contributions, task.submitted_at);
        match self.distributor.submit(task) {
            Ok(assignment) => Ok(assignment),
            Err(e) => {
                if opened {
                    self.aggregator.abandon(&task_id);
                }
                Err(e)
            }
        }
    }

    /// Handle a contribution from a worker.
    ///
    /// Returns the aggregated result when this contribution completed it.
    pub fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &str,
    ) -> Result<Option<AggregatedResult>, DistributeError> {
        match self.aggregator.collect(task_id, worker_id, result) {
            CollectOutcome::Late | CollectOutcome::Unexpected => return Ok(None),
            CollectOutcome::Recorded | CollectOutcome::Replaced => {}
        }
        let aggregated = self.aggregator.aggregate(task_id);
        let next = if aggregated.is_some() {
            Continuation::Finished
        } else {
            Continuation::NeedsMore
        };
        self.distributor.on_completion(task_id, worker_id, next)?;
        Ok(aggregated)
    }

    /// Handle a task failure reported by a worker.
    pub fn fail(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        reason: &str,
    ) -> Result<(), DistributeError> {
        self.distributor.on_failure(task_id, worker_id, reason)?;
        let failed = self
            .distributor
            .get_task(task_id)
            .is_some_and(|t| t.status == TaskStatus::Failed);
        if failed {
            self.aggregator.abandon(task_id);
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatedResult> {
        self.aggregator.subscribe()
    }

    // ------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------

    pub fn list_workers(&self) -> Vec<WorkerInstance> {
        self.manager.list_workers()
    }

    pub fn describe_worker(&self, worker_id: &WorkerId) -> Option<WorkerInstance> {
        self.manager.describe(worker_id)
    }

    /// Every fault observed by supervision, in order.
    pub fn list_faults(&self) -> Vec<Fault> {
        self.audit.faults()
    }

    pub fn get_aggregation(&self, task_id: &TaskId) -> Option<AggregatedResult> {
        self.aggregator.get_aggregation(task_id)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.distributor.get_task(task_id)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.distributor.list_tasks()
    }

    pub fn assignment(&self, task_id: &TaskId) -> Option<TaskAssignment> {
        self.distributor.assignment(task_id)
    }

    /// Received and expected contribution counts while a task is pending.
    pub fn progress(&self, task_id: &TaskId) -> Option<(usize, u32)> {
        self.aggregator.progress(task_id)
    }

    /// Audit entries with sequence number greater than `after`.
    pub fn audit_since(&self, after: u64) -> Vec<AuditEntry> {
        self.audit.since(after)
    }

    pub fn audit_counts(&self) -> AuditCounts {
        self.audit.counts()
    }

    pub fn backlog(&self) -> AggregationBacklog {
        self.aggregator.backlog()
    }

    /// Task counts by status, archived tasks included.
    pub fn task_counts(&self) -> Vec<(TaskStatus, usize)> {
        let tasks = self.stores.tasks();
        TaskStatus::ALL
            .into_iter()
            .map(|status| (status, tasks.count_in(status)))
            .collect()
    }

    /// Faults raised since the last supervision cycle.
    pub fn pending_faults(&self) -> usize {
        self.inbox.len()
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one supervision cycle as of `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        self.supervision.run_cycle_at(now).await
    }

    /// Apply one worker event.
    pub fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Heartbeat { worker_id, at } => {
                if let Err(e) = self.manager.heartbeat_at(&worker_id, at) {
                    debug!(worker_id = %worker_id, error = %e, "Heartbeat rejected");
                }
            }
            WorkerEvent::Completed {
                task_id,
                worker_id,
                result,
            } => {
                if let Err(e) = self.complete(&task_id, &worker_id, &result) {
                    warn!(
                        task_id = %task_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Completion rejected"
                    );
                }
            }
            WorkerEvent::Failed {
                task_id,
                worker_id,
                error,
            } => {
                if let Err(e) = self.fail(&task_id, &worker_id, &error) {
                    warn!(
                        task_id = %task_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Failure report rejected"
                    );
                }
            }
            WorkerEvent::Fault {
                worker_id,
                kind,
                detail,
            } => {
                self.inbox.push(
                    Fault::new(kind, Utc::now())
                        .for_worker(worker_id)
                        .with_context("detail", detail),
                );
            }
        }
    }

    /// Start the event pump, the liveness monitor and the supervision loop.
    pub fn start(self: &Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) {
        let mut handles = Vec::with_capacity(3);

        let orchestrator = self.clone();
        let stop = self.stop.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => orchestrator.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("Event pump stopped");
        }));

        let orchestrator = self.clone();
        let stop = self.stop.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.heartbeat_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        orchestrator.check_liveness(Utc::now());
                    }
                }
            }
            debug!("Liveness monitor stopped");
        }));

        let supervision = self.supervision.clone();
        let stop = self.stop.clone();
        handles.push(tokio::spawn(async move { supervision.run(stop).await }));

        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!("Orchestrator started");
    }

    /// Stop background tasks and drain every Active worker.
    ///
    /// A supervision cycle in progress finishes its batch first.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        for worker in self.manager.list_workers() {
            if worker.state == WorkerState::Active {
                if let Err(e) = self.manager.terminate(&worker.id).await {
                    warn!(worker_id = %worker.id, error = %e, "Terminate on shutdown failed");
                }
            }
        }
        info!("Orchestrator stopped");
    }
}
