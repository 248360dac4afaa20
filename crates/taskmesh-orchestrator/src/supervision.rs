//! Supervision loop: observe -> diagnose -> fix.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskmesh_core::{
    AuditEntry, Fault, FaultKind, TaskId, TaskStatus, WorkerId, WorkerInstance, WorkerState,
};

use crate::aggregator::{AggregationBacklog, ResultAggregator};
use crate::audit::AuditTrail;
use crate::config::Config;
use crate::distributor::TaskDistributor;
use crate::faults::FaultInbox;
use crate::recovery::{HealOutcome, RecoveryPolicy};
use crate::state::Stores;

/// A worker as seen by one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub instance: WorkerInstance,
    pub deadline_extension: Option<DateTime<Utc>>,
}

/// A live task as seen by one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub priority: i32,
    pub assigned_to: Option<WorkerId>,
    pub submitted_at: DateTime<Utc>,
}

/// Consistent read of all three stores plus the drained fault inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    /// Sorted by worker id.
    pub workers: Vec<WorkerView>,
    /// Sorted by task id.
    pub tasks: Vec<TaskView>,
    pub pending_faults: Vec<Fault>,
    pub backlog: AggregationBacklog,
}

impl Snapshot {
    pub fn queued(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }
}

/// Thresholds `diagnose` works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisPolicy {
    pub heartbeat_timeout: chrono::Duration,
    pub max_retained_aggregations: usize,
    pub max_queued_tasks: usize,
}

impl DiagnosisPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout_delta(),
            max_retained_aggregations: config.max_retained_aggregations,
            max_queued_tasks: config.max_queued_tasks,
        }
    }
}

/// Turn a snapshot into an ordered, de-duplicated fault list.
///
/// Pure: the same snapshot always yields the same list. Faults are ordered
/// by severity, then observation time, then worker and task id.
pub fn diagnose(snapshot: &Snapshot, policy: &DiagnosisPolicy) -> Vec<Fault> {
    let assigned: HashMap<&TaskId, &WorkerId> = snapshot
        .tasks
        .iter()
        .filter_map(|t| t.assigned_to.as_ref().map(|w| (&t.task_id, w)))
        .collect();

    let mut faults = Vec::new();

    // Stale-task timeouts are attributed to the worker holding the task.
    for fault in &snapshot.pending_faults {
        let mut fault = fault.clone();
        if fault.kind == FaultKind::Timeout && fault.worker_id.is_none() {
            if let Some(worker_id) = fault.task_id.as_ref().and_then(|t| assigned.get(t)) {
                fault.worker_id = Some((*worker_id).clone());
            }
        }
        faults.push(fault);
    }

    let reported: HashSet<&WorkerId> = snapshot
        .pending_faults
        .iter()
        .filter(|f| f.kind == FaultKind::Timeout && f.task_id.is_none())
        .filter_map(|f| f.worker_id.as_ref())
        .collect();

    for view in &snapshot.workers {
        let worker = &view.instance;
        if worker.state != WorkerState::Failed || worker.load == 0 {
            continue;
        }
        if reported.contains(&worker.id) {
            continue;
        }
        let deadline = view
            .deadline_extension
            .unwrap_or(worker.state_changed_at + policy.heartbeat_timeout);
        if snapshot.taken_at < deadline {
            continue;
        }
        faults.push(
            Fault::timeout(deadline)
                .for_worker(worker.id.clone())
                .with_context("orphans", worker.load)
                .with_context("source", "derived"),
        );
    }

    if snapshot.backlog.completed > policy.max_retained_aggregations {
        faults.push(
            Fault::new(FaultKind::ResourceExhaustion, snapshot.taken_at)
                .with_context("resource", "aggregations")
                .with_context("retained", snapshot.backlog.completed)
                .with_context("limit", policy.max_retained_aggregations),
        );
    }
    let queued = snapshot.queued();
    if queued > policy.max_queued_tasks {
        faults.push(
            Fault::new(FaultKind::ResourceExhaustion, snapshot.taken_at)
                .with_context("resource", "queued_tasks")
                .with_context("queued", queued)
                .with_context("limit", policy.max_queued_tasks),
        );
    }

    let mut seen = BTreeSet::new();
    faults.retain(|f| seen.insert(f.fingerprint()));
    faults.sort_by(|a, b| {
        (a.kind.severity_rank(), a.observed_at, &a.worker_id, &a.task_id).cmp(&(
            b.kind.severity_rank(),
            b.observed_at,
            &b.worker_id,
            &b.task_id,
        ))
    });
    faults
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(Fault, HealOutcome)>,
}

impl CycleReport {
    pub fn healed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn escalated(&self) -> usize {
        self.outcomes.len() - self.healed()
    }
}

/// Periodic supervision of the worker pool.
pub struct SupervisionLoop {
    stores: Arc<Stores>,
    inbox: Arc<FaultInbox>,
    audit: Arc<AuditTrail>,
    aggregator: ResultAggregator,
    distributor: TaskDistributor,
    recovery: Arc<RecoveryPolicy>,
    config: Arc<Config>,
    policy: DiagnosisPolicy,
}

impl SupervisionLoop {
    pub fn new(
        stores: Arc<Stores>,
        inbox: Arc<FaultInbox>,
        audit: Arc<AuditTrail>,
        aggregator: ResultAggregator,
        distributor: TaskDistributor,
        recovery: Arc<RecoveryPolicy>,
        config: Arc<Config>,
    ) -> Self {
        let policy = DiagnosisPolicy::from_config(&config);
        Self {
            stores,
            inbox,
            audit,
            aggregator,
            distributor,
            recovery,
            config,
            policy,
        }
    }

    /// Snapshot the stores now.
    pub fn observe(&self) -> Snapshot {
        self.observe_at(Utc::now())
    }

    /// Snapshot the stores, holding all three read locks in order, and drain
    /// the fault inbox.
    pub fn observe_at(&self, now: DateTime<Utc>) -> Snapshot {
        let (mut workers, mut tasks, backlog) = {
            let workers = self.stores.workers();
            let tasks = self.stores.tasks();
            let results = self.stores.results();

            let worker_views: Vec<WorkerView> = workers
                .values()
                .map(|e| WorkerView {
                    instance: e.instance.clone(),
                    deadline_extension: e.deadline_extension,
                })
                .collect();
            let task_views: Vec<TaskView> = tasks
                .values()
                .map(|e| TaskView {
                    task_id: e.task.id.clone(),
                    status: e.task.status,
                    priority: e.task.priority,
                    assigned_to: e.assigned_to().cloned(),
                    submitted_at: e.task.submitted_at,
                })
                .collect();
            let backlog = AggregationBacklog {
                pending: results.pending.len(),
                completed: results.completed.len(),
            };
            (worker_views, task_views, backlog)
        };
        workers.sort_by(|a, b| a.instance.id.cmp(&b.instance.id));
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        Snapshot {
            taken_at: now,
            workers,
            tasks,
            pending_faults: self.inbox.drain(),
            backlog,
        }
    }

    pub fn diagnose(&self, snapshot: &Snapshot) -> Vec<Fault> {
        diagnose(snapshot, &self.policy)
    }

    /// Heal faults in order, auditing each fault and its outcome.
    pub async fn fix(&self, faults: Vec<Fault>, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        for fault in faults {
            self.audit.record_fault(&fault, now);
            let outcome = self.recovery.heal_at(&fault, now).await;
            let entry = match &outcome {
                HealOutcome::Success(action) => {
                    AuditEntry::heal_applied(&fault, &action.to_string())
                }
                HealOutcome::Escalate(reason) => AuditEntry::heal_escalated(&fault, reason),
            };
            self.audit.record_at(entry, now);
            report.outcomes.push((fault, outcome));
        }
        report
    }

    /// One full cycle as of `now`: sweep, observe, diagnose, fix.
    ///
    /// Healing may fail or spawn workers, so queued tasks are placed again
    /// after a non-empty fix batch.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        self.aggregator.sweep(now);
        let snapshot = self.observe_at(now);
        let faults = self.diagnose(&snapshot);
        if faults.is_empty() {
            return CycleReport::default();
        }
        debug!(faults = faults.len(), "Supervision cycle diagnosed faults");
        let report = self.fix(faults, now).await;
        self.distributor.rebalance();
        report
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run cycles every `cycle_interval` until `stop` is cancelled.
    ///
    /// A cycle that has started always finishes its fix batch; no cycle
    /// starts once `stop` is observed.
    pub async fn run(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.cycle_interval, "Supervision loop started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.run_cycle().await;
            if !report.outcomes.is_empty() {
                info!(
                    healed = report.healed(),
                    escalated = report.escalated(),
                    "Supervision cycle finished"
                );
            }
        }

        info!("Supervision loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::Continuation;
    use crate::recovery::RecoveryAction;
    use crate::testing::{harness, test_config};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use taskmesh_core::{AuditKind, Task};

    fn policy() -> DiagnosisPolicy {
        DiagnosisPolicy::from_config(&test_config())
    }

    fn worker_view(id: &str, state: WorkerState, load: u32, changed: DateTime<Utc>) -> WorkerView {
        let mut instance = WorkerInstance::new("shard", BTreeMap::new()).with_id(WorkerId::new(id));
        instance.state = state;
        instance.load = load;
        instance.state_changed_at = changed;
        WorkerView {
            instance,
            deadline_extension: None,
        }
    }

    fn snapshot(at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            taken_at: at,
            workers: Vec::new(),
            tasks: Vec::new(),
            pending_faults: Vec::new(),
            backlog: AggregationBacklog::default(),
        }
    }

    #[test]
    fn test_diagnose_orders_by_severity_and_dedupes() {
        let at = Utc::now();
        let mut snap = snapshot(at);
        let crash = Fault::crash(WorkerId::new("w2"), at + chrono::Duration::seconds(5));
        snap.pending_faults = vec![
            Fault::new(FaultKind::Unrecognized, at),
            Fault::connection_failure(WorkerId::new("w1"), at),
            crash.clone(),
            Fault::timeout(at).for_worker(WorkerId::new("w3")),
            crash,
        ];

        let faults = diagnose(&snap, &policy());

        let kinds: Vec<FaultKind> = faults.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FaultKind::Crash,
                FaultKind::Timeout,
                FaultKind::ConnectionFailure,
                FaultKind::Unrecognized,
            ]
        );
        assert_eq!(faults, diagnose(&snap, &policy()));
    }

    #[test]
    fn test_stale_task_timeout_attributed_to_holder() {
        let at = Utc::now();
        let mut snap = snapshot(at);
        snap.tasks.push(TaskView {
            task_id: TaskId::new("t1"),
            status: TaskStatus::Assigned,
            priority: 0,
            assigned_to: Some(WorkerId::new("w1")),
            submitted_at: at,
        });
        snap.pending_faults.push(Fault::timeout(at).for_task(TaskId::new("t1")));

        let faults = diagnose(&snap, &policy());
        assert_eq!(faults[0].worker_id, Some(WorkerId::new("w1")));
        assert_eq!(faults[0].task_id, Some(TaskId::new("t1")));
    }

    #[test]
    fn test_derived_timeout_waits_for_extension() {
        let at = Utc::now();
        let timeout = policy().heartbeat_timeout;
        let mut view = worker_view("w2", WorkerState::Failed, 2, at);
        view.deadline_extension = Some(at + timeout * 2);

        let mut snap = snapshot(at + timeout + chrono::Duration::seconds(1));
        snap.workers.push(view.clone());
        assert!(diagnose(&snap, &policy()).is_empty());

        snap.taken_at = at + timeout * 2;
        let faults = diagnose(&snap, &policy());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Timeout);
        assert_eq!(faults[0].observed_at, at + timeout * 2);

        // A later cycle re-derives the same fault.
        snap.taken_at = at + timeout * 3;
        assert_eq!(diagnose(&snap, &policy())[0].fingerprint(), faults[0].fingerprint());
    }

    #[test]
    fn test_derived_timeout_suppressed_by_reported_one() {
        let at = Utc::now();
        let mut snap = snapshot(at + chrono::Duration::minutes(5));
        snap.workers.push(worker_view("w2", WorkerState::Failed, 1, at));
        snap.pending_faults.push(Fault::timeout(at).for_worker(WorkerId::new("w2")));

        let faults = diagnose(&snap, &policy());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].observed_at, at);
    }

    #[test]
    fn test_exhaustion_over_limits() {
        let at = Utc::now();
        let mut snap = snapshot(at);
        snap.backlog.completed = policy().max_retained_aggregations + 1;

        let faults = diagnose(&snap, &policy());
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::ResourceExhaustion);
        assert_eq!(
            faults[0].context.get("resource").map(String::as_str),
            Some("aggregations")
        );
    }

    #[tokio::test]
    async fn test_observe_drains_inbox() {
        let h = harness(test_config());
        h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.distributor.submit(Task::new("{}")).unwrap();
        h.inbox.push(Fault::new(FaultKind::Unrecognized, Utc::now()));

        let snap = h.supervision.observe();

        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.tasks.len(), 1);
        assert_eq!(snap.pending_faults.len(), 1);
        assert!(h.inbox.is_empty());
    }

    #[tokio::test]
    async fn test_fix_audits_fault_and_outcome() {
        let h = harness(test_config());
        let fault = Fault::new(FaultKind::Unrecognized, Utc::now());

        let report = h.supervision.fix(vec![fault], Utc::now()).await;

        assert_eq!(report.escalated(), 1);
        let kinds: Vec<AuditKind> = h.audit.since(0).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::FaultObserved, AuditKind::HealEscalated]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_cycle_finish() {
        let h = harness(test_config());
        let worker = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.backend.close(&worker);
        h.backend.fail_reconnects(2);
        h.inbox.push(Fault::connection_failure(worker.clone(), Utc::now()));

        let stop = CancellationToken::new();
        let supervision = h.supervision.clone();
        let handle = tokio::spawn({
            let stop = stop.clone();
            async move { supervision.run(stop).await }
        });

        // The first cycle is now sleeping between reconnect attempts.
        tokio::time::sleep(Duration::from_millis(5)).await;
        stop.cancel();
        handle.await.unwrap();

        let applied: Vec<_> = h
            .audit
            .since(0)
            .into_iter()
            .filter(|e| e.kind == AuditKind::HealApplied)
            .collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(h.backend.reconnect_calls(), 3);
        assert_eq!(h.manager.connection_healthy(&worker), Some(true));

        // Nothing runs after stop.
        h.inbox.push(Fault::new(FaultKind::Unrecognized, Utc::now()));
        tokio::time::sleep(test_config().cycle_interval * 3).await;
        assert_eq!(h.inbox.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cycle_places_queued_task_on_replacement() {
        let h = harness(test_config());
        let worker = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        let task = Task::new("{}").with_expected_contributions(2);
        h.aggregator.expect(&task.id, 2, task.submitted_at);
        let first = h.distributor.submit(task).unwrap();
        h.aggregator.collect(&first.task_id, &worker, "{\"a\":1}");
        h.distributor
            .on_completion(&first.task_id, &worker, Continuation::NeedsMore)
            .unwrap();
        assert!(h.distributor.assignment(&first.task_id).is_none());
        h.inbox.push(Fault::crash(worker.clone(), Utc::now()));

        let stop = CancellationToken::new();
        let supervision = h.supervision.clone();
        let handle = tokio::spawn({
            let stop = stop.clone();
            async move { supervision.run(stop).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        stop.cancel();
        handle.await.unwrap();

        let replacement = h.recovery.replacement_for(&worker).unwrap();
        let second = h.distributor.assignment(&first.task_id).unwrap();
        assert_eq!(second.worker_id, replacement);
        assert_eq!(
            h.distributor.get_task(&first.task_id).unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_cycle_extends_then_replaces_silent_worker() {
        let h = harness(test_config());
        let worker = h.manager.spawn("shard", BTreeMap::new()).await.unwrap();
        h.distributor.submit(Task::new("{}")).unwrap();
        let t1 = Utc::now() + chrono::Duration::seconds(10);
        h.manager.check_liveness(t1);

        let first = h.supervision.run_cycle_at(t1).await;
        assert!(matches!(
            first.outcomes[0].1,
            HealOutcome::Success(RecoveryAction::DeadlineExtended { .. })
        ));

        let t2 = t1 + test_config().heartbeat_timeout_delta() + chrono::Duration::seconds(1);
        let second = h.supervision.run_cycle_at(t2).await;
        assert!(matches!(
            second.outcomes[0].1,
            HealOutcome::Success(RecoveryAction::Replaced { reassigned: 1, .. })
        ));
        assert_eq!(h.manager.describe(&worker).unwrap().load, 0);
    }
}
