//! Result aggregation.
//!
//! Contributions are keyed by (task, worker); a task's aggregation completes
//! once, when the expected number of distinct workers have reported.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use taskmesh_core::{AggregatedResult, Fault, ResultRecord, TaskId, WorkerId};

use crate::config::Config;
use crate::faults::FaultInbox;
use crate::state::{PendingAggregation, Stores};

const COMPLETED_CHANNEL_CAPACITY: usize = 256;

/// Combines a task's contributions into one result.
///
/// Contributions arrive sorted by worker id.
pub trait ResultMerger: Send + Sync {
    fn merge(&self, task_id: &TaskId, contributions: &[ResultRecord]) -> String;
}

/// Builds a JSON object keyed by worker id.
///
/// Values are the parsed contributions, or the raw string when a
/// contribution is not valid JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMerger;

impl ResultMerger for JsonMerger {
    fn merge(&self, _task_id: &TaskId, contributions: &[ResultRecord]) -> String {
        let merged: serde_json::Map<String, Value> = contributions
            .iter()
            .map(|record| {
                let value = serde_json::from_str(&record.result)
                    .unwrap_or_else(|_| Value::String(record.result.clone()));
                (record.worker_id.to_string(), value)
            })
            .collect();
        Value::Object(merged).to_string()
    }
}

/// What `collect` did with a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// First contribution from this worker.
    Recorded,
    /// The worker had already contributed; the new result replaced the old.
    Replaced,
    /// The task's aggregation already completed.
    Late,
    /// No aggregation is open for the task.
    Unexpected,
}

/// Pending and retained aggregation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationBacklog {
    pub pending: usize,
    pub completed: usize,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub flagged: Vec<TaskId>,
}

/// Owns the result table.
#[derive(Clone)]
pub struct ResultAggregator {
    stores: Arc<Stores>,
    inbox: Arc<FaultInbox>,
    config: Arc<Config>,
    merger: Arc<dyn ResultMerger>,
    completed_tx: broadcast::Sender<AggregatedResult>,
}

impl ResultAggregator {
    pub fn new(stores: Arc<Stores>, inbox: Arc<FaultInbox>, config: Arc<Config>) -> Self {
        let (completed_tx, _) = broadcast::channel(COMPLETED_CHANNEL_CAPACITY);
        Self {
            stores,
            inbox,
            config,
            merger: Arc::new(JsonMerger),
            completed_tx,
        }
    }

    /// Use a custom merger.
    pub fn with_merger(mut self, merger: Arc<dyn ResultMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Open an aggregation expecting `expected` distinct contributions.
    ///
    /// Returns false when one is already pending or completed for the task.
    pub fn expect(&self, task_id: &TaskId, expected: u32, opened_at: DateTime<Utc>) -> bool {
        let mut results = self.stores.results_mut();
        if results.completed.contains_key(task_id) || results.pending.contains_key(task_id) {
            return false;
        }
        results.pending.insert(
            task_id.clone(),
            PendingAggregation::new(expected.max(1), opened_at),
        );
        true
    }

    /// Record a contribution received now.
    pub fn collect(&self, task_id: &TaskId, worker_id: &WorkerId, result: &str) -> CollectOutcome {
        self.collect_at(task_id, worker_id, result, Utc::now())
    }

    /// Record a contribution. A repeat from the same worker replaces the
    /// earlier one and is reported as `Replaced`.
    pub fn collect_at(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        result: &str,
        received_at: DateTime<Utc>,
    ) -> CollectOutcome {
        let mut results = self.stores.results_mut();
        if results.completed.contains_key(task_id) {
            debug!(task_id = %task_id, worker_id = %worker_id, "Late result dropped");
            return CollectOutcome::Late;
        }
        let Some(pending) = results.pending.get_mut(task_id) else {
            warn!(task_id = %task_id, worker_id = %worker_id, "Result for unknown task dropped");
            return CollectOutcome::Unexpected;
        };

        let record = ResultRecord {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            result: result.to_string(),
            received_at,
        };
        match pending.records.insert(worker_id.clone(), record) {
            Some(_) => {
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    "Duplicate result, replacing earlier contribution"
                );
                CollectOutcome::Replaced
            }
            None => CollectOutcome::Recorded,
        }
    }

    /// Merge the task's contributions once enough distinct workers reported.
    ///
    /// Returns `None` while contributions are missing. After completion the
    /// stored result is returned unchanged.
    pub fn aggregate(&self, task_id: &TaskId) -> Option<AggregatedResult> {
        let now = Utc::now();
        let aggregated = {
            let mut results = self.stores.results_mut();
            if let Some(done) = results.completed.get(task_id) {
                return Some(done.clone());
            }
            if !results.pending.get(task_id)?.is_satisfied() {
                return None;
            }
            let pending = results.pending.remove(task_id)?;
            let records: Vec<ResultRecord> = pending.records.into_values().collect();
            let aggregated = AggregatedResult {
                task_id: task_id.clone(),
                contribution_count: records.len() as u32,
                merged_result: self.merger.merge(task_id, &records),
                completed_at: now,
            };
            results.completed.insert(task_id.clone(), aggregated.clone());
            aggregated
        };

        info!(
            task_id = %task_id,
            contributions = aggregated.contribution_count,
            "Aggregation completed"
        );
        let _ = self.completed_tx.send(aggregated.clone());
        Some(aggregated)
    }

    /// Evict expired aggregations and flag stale pending ones.
    ///
    /// A pending aggregation is flagged at most once per threshold window.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let ttl = self.config.aggregation_ttl_delta();
        let stale = self.config.stale_task_delta();

        let (evicted, mut flagged) = {
            let mut results = self.stores.results_mut();
            let before = results.completed.len();
            results.completed.retain(|_, a| now - a.completed_at <= ttl);
            let evicted = before - results.completed.len();

            let mut flagged = Vec::new();
            for (task_id, pending) in results.pending.iter_mut() {
                if now - pending.opened_at <= stale {
                    continue;
                }
                if pending.flagged_at.is_some_and(|at| now - at < stale) {
                    continue;
                }
                pending.flagged_at = Some(now);
                flagged.push((
                    task_id.clone(),
                    (now - pending.opened_at).num_seconds(),
                    pending.records.len(),
                    pending.expected,
                ));
            }
            (evicted, flagged)
        };
        flagged.sort_by(|a, b| a.0.cmp(&b.0));

        if evicted > 0 {
            debug!(evicted, "Expired aggregations evicted");
        }
        for (task_id, age, have, expected) in &flagged {
            self.inbox.push(
                Fault::timeout(now)
                    .for_task(task_id.clone())
                    .with_context("pending_secs", age)
                    .with_context("contributions", format!("{have}/{expected}")),
            );
        }
        SweepReport {
            evicted,
            flagged: flagged.into_iter().map(|(id, ..)| id).collect(),
        }
    }

    /// Drop the oldest completed aggregations until at most `keep` remain.
    pub fn evict_least_recently_completed(&self, keep: usize) -> usize {
        let mut results = self.stores.results_mut();
        let excess = results.completed.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(DateTime<Utc>, TaskId)> = results
            .completed
            .values()
            .map(|a| (a.completed_at, a.task_id.clone()))
            .collect();
        by_age.sort();
        for (_, task_id) in by_age.into_iter().take(excess) {
            results.completed.remove(&task_id);
        }
        excess
    }

    /// Close a pending aggregation without producing a result.
    pub fn abandon(&self, task_id: &TaskId) -> bool {
        self.stores.results_mut().pending.remove(task_id).is_some()
    }

    pub fn backlog(&self) -> AggregationBacklog {
        let results = self.stores.results();
        AggregationBacklog {
            pending: results.pending.len(),
            completed: results.completed.len(),
        }
    }

    /// Stream of completed aggregations.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregatedResult> {
        self.completed_tx.subscribe()
    }

    pub fn get_aggregation(&self, task_id: &TaskId) -> Option<AggregatedResult> {
        self.stores.results().completed.get(task_id).cloned()
    }

    /// Workers that contributed to a pending aggregation, sorted by id.
    pub fn contributors(&self, task_id: &TaskId) -> Vec<WorkerId> {
        self.stores
            .results()
            .pending
            .get(task_id)
            .map(|p| p.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Expected and received counts for a pending aggregation.
    pub fn progress(&self, task_id: &TaskId) -> Option<(usize, u32)> {
        let results = self.stores.results();
        let pending = results.pending.get(task_id)?;
        Some((pending.records.len(), pending.expected))
    }
}
