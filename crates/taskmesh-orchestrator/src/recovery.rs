//! Recovery policy - maps each fault kind to a healing action.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use taskmesh_core::{Fault, FaultKind, TaskId, WorkerId, WorkerState};

use crate::aggregator::ResultAggregator;
use crate::backend::WorkerBackend;
use crate::config::{BackoffPolicy, Config};
use crate::distributor::TaskDistributor;
use crate::instance_manager::InstanceManager;

/// How many heal outcomes are remembered for idempotence.
const OUTCOME_CACHE_CAPACITY: usize = 4096;

/// What a successful heal did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The same fault was healed before; nothing was done.
    AlreadyHealed,
    /// A fresh dispatch channel was attached.
    Reconnected { attempts: u32, redelivered: usize },
    /// Old aggregations evicted and low-priority queued tasks shed.
    Relieved { evicted: usize, shed: usize },
    /// First timeout strike.
    DeadlineExtended { until: DateTime<Utc> },
    /// A replacement was spawned (or already existed) and orphans moved.
    Replaced {
        replacement: WorkerId,
        reassigned: usize,
        queued: usize,
    },
    /// Orphans moved without spawning a replacement.
    Reassigned { reassigned: usize, queued: usize },
    /// A task that timed out twice was failed.
    TaskFailed { task_id: TaskId },
    /// Nothing needed doing.
    NoOp { reason: String },
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyHealed => write!(f, "already_healed"),
            Self::Reconnected {
                attempts,
                redelivered,
            } => write!(f, "reconnected attempts={attempts} redelivered={redelivered}"),
            Self::Relieved { evicted, shed } => {
                write!(f, "relieved evicted={evicted} shed={shed}")
            }
            Self::DeadlineExtended { until } => {
                write!(f, "deadline_extended until={}", until.to_rfc3339())
            }
            Self::Replaced {
                replacement,
                reassigned,
                queued,
            } => write!(
                f,
                "replaced replacement={replacement} reassigned={reassigned} queued={queued}"
            ),
            Self::Reassigned { reassigned, queued } => {
                write!(f, "reassigned reassigned={reassigned} queued={queued}")
            }
            Self::TaskFailed { task_id } => write!(f, "task_failed task={task_id}"),
            Self::NoOp { reason } => write!(f, "noop reason={reason}"),
        }
    }
}

/// Result of healing one fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    Success(RecoveryAction),
    Escalate(String),
}

impl HealOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StrikeKey {
    Worker(WorkerId),
    Task(TaskId),
}

#[derive(Debug, Default)]
struct RecoveryState {
    outcomes: HashMap<String, HealOutcome>,
    outcome_order: VecDeque<String>,
    strikes: HashMap<StrikeKey, DateTime<Utc>>,
    /// Crashed worker -> its replacement.
    replacements: HashMap<WorkerId, WorkerId>,
}

impl RecoveryState {
    fn remember(&mut self, fingerprint: String, outcome: HealOutcome) {
        if self.outcomes.insert(fingerprint.clone(), outcome).is_none() {
            self.outcome_order.push_back(fingerprint);
        }
        while self.outcome_order.len() > OUTCOME_CACHE_CAPACITY {
            if let Some(oldest) = self.outcome_order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
    }
}

/// Stateless mapping from fault to action, plus the bookkeeping that keeps
/// healing idempotent.
pub struct RecoveryPolicy {
    manager: InstanceManager,
    distributor: TaskDistributor,
    aggregator: ResultAggregator,
    backend: Arc<dyn WorkerBackend>,
    config: Arc<Config>,
    state: Mutex<RecoveryState>,
}

impl RecoveryPolicy {
    pub fn new(
        manager: InstanceManager,
        distributor: TaskDistributor,
        aggregator: ResultAggregator,
        backend: Arc<dyn WorkerBackend>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            manager,
            distributor,
            aggregator,
            backend,
            config,
            state: Mutex::new(RecoveryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Heal a fault now.
    pub async fn heal(&self, fault: &Fault) -> HealOutcome {
        self.heal_at(fault, Utc::now()).await
    }

    /// Heal a fault as of `now`.
    ///
    /// Re-healing a fault with the same fingerprint returns
    /// `Success(AlreadyHealed)` or the original escalation, with no side
    /// effects.
    pub async fn heal_at(&self, fault: &Fault, now: DateTime<Utc>) -> HealOutcome {
        let fingerprint = fault.fingerprint();
        if let Some(previous) = self.lock().outcomes.get(&fingerprint) {
            return match previous {
                HealOutcome::Success(_) => HealOutcome::Success(RecoveryAction::AlreadyHealed),
                HealOutcome::Escalate(reason) => HealOutcome::Escalate(reason.clone()),
            };
        }

        self.prune();
        let outcome = match fault.kind {
            FaultKind::ConnectionFailure => self.heal_connection(fault).await,
            FaultKind::ResourceExhaustion => self.heal_exhaustion(fault),
            FaultKind::Timeout => self.heal_timeout(fault, now).await,
            FaultKind::Crash => self.heal_crash(fault, now).await,
            FaultKind::Unrecognized => HealOutcome::Escalate(format!(
                "unrecognized fault: {}",
                fault
                    .context
                    .get("detail")
                    .map(String::as_str)
                    .unwrap_or("no detail")
            )),
        };

        match &outcome {
            HealOutcome::Success(action) => info!(
                kind = %fault.kind,
                fingerprint = %fingerprint,
                action = %action,
                "Fault healed"
            ),
            HealOutcome::Escalate(reason) => error!(
                kind = %fault.kind,
                fingerprint = %fingerprint,
                reason = %reason,
                "Fault escalated"
            ),
        }
        self.lock().remember(fingerprint, outcome.clone());
        outcome
    }

    async fn heal_connection(&self, fault: &Fault) -> HealOutcome {
        let Some(worker_id) = &fault.worker_id else {
            return HealOutcome::Escalate("connection failure without a worker".to_string());
        };
        match self.manager.connection_healthy(worker_id) {
            None => {
                return HealOutcome::Success(RecoveryAction::NoOp {
                    reason: "worker no longer live".to_string(),
                })
            }
            Some(true) => {
                return HealOutcome::Success(RecoveryAction::NoOp {
                    reason: "connection healthy".to_string(),
                })
            }
            Some(false) => {}
        }

        let policy = &self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            match self.backend.reconnect(worker_id).await {
                Ok(tx) => {
                    if !self.manager.attach_connection(worker_id, tx) {
                        return HealOutcome::Success(RecoveryAction::NoOp {
                            reason: "worker left during reconnect".to_string(),
                        });
                    }
                    let redelivered = self.distributor.redeliver(worker_id);
                    return HealOutcome::Success(RecoveryAction::Reconnected {
                        attempts: attempt,
                        redelivered,
                    });
                }
                Err(e) => {
                    warn!(
                        worker_id = %worker_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    if attempt < policy.max_attempts {
                        tokio::time::sleep(jittered(policy, attempt)).await;
                    }
                }
            }
        }
        HealOutcome::Escalate(format!(
            "reconnect to {worker_id} failed after {} attempts",
            policy.max_attempts
        ))
    }

    fn heal_exhaustion(&self, fault: &Fault) -> HealOutcome {
        let resource = fault.context.get("resource").map(String::as_str);
        let evicted = if matches!(resource, None | Some("aggregations")) {
            let keep = self.config.max_retained_aggregations * 3 / 4;
            self.aggregator.evict_least_recently_completed(keep)
        } else {
            0
        };
        let shed = if matches!(resource, None | Some("queued_tasks")) {
            let keep = self.config.max_queued_tasks * 3 / 4;
            let shed = self.distributor.shed_queued(keep);
            for task_id in &shed {
                self.aggregator.abandon(task_id);
            }
            shed.len()
        } else {
            0
        };
        HealOutcome::Success(RecoveryAction::Relieved { evicted, shed })
    }

    async fn heal_timeout(&self, fault: &Fault, now: DateTime<Utc>) -> HealOutcome {
        let key = match (&fault.task_id, &fault.worker_id) {
            (Some(task_id), _) => StrikeKey::Task(task_id.clone()),
            (None, Some(worker_id)) => StrikeKey::Worker(worker_id.clone()),
            (None, None) => {
                return HealOutcome::Escalate("timeout without a subject".to_string())
            }
        };
        if let StrikeKey::Task(task_id) = &key {
            if !self.task_is_live(task_id) {
                self.lock().strikes.remove(&key);
                return HealOutcome::Success(RecoveryAction::NoOp {
                    reason: format!("task {task_id} no longer live"),
                });
            }
        }

        let previous = self.lock().strikes.get(&key).copied();
        let second_strike = match (&key, previous) {
            (_, None) => false,
            // A heartbeat since the last strike resets the count.
            (StrikeKey::Worker(worker_id), Some(struck_at)) => self
                .manager
                .describe(worker_id)
                .map_or(true, |w| w.last_heartbeat <= struck_at),
            (StrikeKey::Task(_), Some(_)) => true,
        };

        if !second_strike {
            self.lock().strikes.insert(key, now);
            let until = now + self.config.heartbeat_timeout_delta();
            let Some(worker_id) = &fault.worker_id else {
                return HealOutcome::Success(RecoveryAction::DeadlineExtended { until });
            };
            return match self.manager.extend_deadline(worker_id, until) {
                Ok(()) => HealOutcome::Success(RecoveryAction::DeadlineExtended { until }),
                Err(e) => HealOutcome::Success(RecoveryAction::NoOp {
                    reason: format!("deadline not extended: {e}"),
                }),
            };
        }

        self.lock().strikes.remove(&key);
        match (&fault.worker_id, key) {
            (Some(worker_id), _) => {
                self.replace_worker(worker_id, now, "repeated_timeout")
                    .await
            }
            (None, StrikeKey::Task(task_id)) => {
                match self
                    .distributor
                    .fail_task(&task_id, "no result within stale threshold")
                {
                    Ok(true) => {}
                    Ok(false) => {
                        return HealOutcome::Success(RecoveryAction::NoOp {
                            reason: format!("task {task_id} already finished"),
                        })
                    }
                    Err(e) => {
                        return HealOutcome::Escalate(format!(
                            "could not fail task {task_id}: {e}"
                        ))
                    }
                }
                self.aggregator.abandon(&task_id);
                HealOutcome::Success(RecoveryAction::TaskFailed { task_id })
            }
            (None, StrikeKey::Worker(_)) => {
                HealOutcome::Escalate("timeout without a subject".to_string())
            }
        }
    }

    async fn heal_crash(&self, fault: &Fault, now: DateTime<Utc>) -> HealOutcome {
        match &fault.worker_id {
            Some(worker_id) => self.replace_worker(worker_id, now, "crash").await,
            None => HealOutcome::Escalate("crash without a worker".to_string()),
        }
    }

    /// Fail a worker if needed, spawn at most one replacement for it and
    /// move its orphans.
    async fn replace_worker(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> HealOutcome {
        let Some(instance) = self.manager.describe(worker_id) else {
            return HealOutcome::Escalate(format!("unknown worker {worker_id}"));
        };

        match instance.state {
            WorkerState::Starting | WorkerState::Active => {
                if let Err(e) = self.manager.mark_failed(worker_id, reason, now) {
                    return HealOutcome::Escalate(format!("could not fail {worker_id}: {e}"));
                }
            }
            WorkerState::Draining => {
                self.manager.force_terminate(worker_id, now).await;
                let moved = self.distributor.reassign_orphans(worker_id);
                return HealOutcome::Success(RecoveryAction::Reassigned {
                    reassigned: moved.reassigned.len(),
                    queued: moved.queued.len(),
                });
            }
            // Terminated on request: nothing to replace.
            WorkerState::Terminated => {
                let moved = self.distributor.reassign_orphans(worker_id);
                return HealOutcome::Success(RecoveryAction::Reassigned {
                    reassigned: moved.reassigned.len(),
                    queued: moved.queued.len(),
                });
            }
            WorkerState::Failed => {}
        }

        let existing = self.lock().replacements.get(worker_id).cloned();
        let replacement = match existing {
            Some(replacement) => Some(replacement),
            None => match self.manager.spawn(&instance.kind, instance.config.clone()).await {
                Ok(replacement) => {
                    self.lock()
                        .replacements
                        .insert(worker_id.clone(), replacement.clone());
                    info!(
                        worker_id = %worker_id,
                        replacement = %replacement,
                        "Replacement worker spawned"
                    );
                    Some(replacement)
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Replacement spawn failed");
                    None
                }
            },
        };

        let moved = self.distributor.reassign_orphans(worker_id);
        match replacement {
            Some(replacement) => HealOutcome::Success(RecoveryAction::Replaced {
                replacement,
                reassigned: moved.reassigned.len(),
                queued: moved.queued.len(),
            }),
            None if !moved.queued.is_empty() => HealOutcome::Escalate(format!(
                "no replacement for {worker_id}; {} tasks left queued",
                moved.queued.len()
            )),
            None => HealOutcome::Success(RecoveryAction::Reassigned {
                reassigned: moved.reassigned.len(),
                queued: 0,
            }),
        }
    }

    /// Replacement spawned for a crashed worker, if any.
    pub fn replacement_for(&self, worker_id: &WorkerId) -> Option<WorkerId> {
        self.lock().replacements.get(worker_id).cloned()
    }

    /// Strikes currently held against workers and tasks.
    pub fn strike_count(&self) -> usize {
        self.lock().strikes.len()
    }

    fn task_is_live(&self, task_id: &TaskId) -> bool {
        self.distributor
            .get_task(task_id)
            .is_some_and(|t| !t.status.is_terminal())
    }

    /// Forget strikes and replacement links whose subject has left the tables.
    fn prune(&self) {
        let (keys, crashed): (Vec<StrikeKey>, Vec<WorkerId>) = {
            let state = self.lock();
            (
                state.strikes.keys().cloned().collect(),
                state.replacements.keys().cloned().collect(),
            )
        };
        let gone: Vec<StrikeKey> = keys
            .into_iter()
            .filter(|key| match key {
                StrikeKey::Worker(worker_id) => !self.manager.is_tracked(worker_id),
                StrikeKey::Task(task_id) => !self.task_is_live(task_id),
            })
            .collect();
        let purged: Vec<WorkerId> = crashed
            .into_iter()
            .filter(|worker_id| !self.manager.is_tracked(worker_id))
            .collect();
        if gone.is_empty() && purged.is_empty() {
            return;
        }

        let mut state = self.lock();
        for key in &gone {
            state.strikes.remove(key);
        }
        for worker_id in &purged {
            state.replacements.remove(worker_id);
        }
    }
}

/// Backoff delay plus up to 25% random jitter.
fn jittered(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let base = policy.delay_for(attempt);
    let spread = (base.as_millis() / 4) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
