//! TaskMesh Orchestrator Library
//!
//! This crate runs pools of worker instances: it spawns and retires them,
//! distributes tasks across them, aggregates their results, and supervises
//! the whole pool, healing faults as they are observed.

pub mod aggregator;
pub mod audit;
pub mod backend;
pub mod config;
pub mod distributor;
pub mod faults;
pub mod http;
pub mod instance_manager;
pub mod local;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod supervision;

#[cfg(test)]
mod testing;

pub use aggregator::{CollectOutcome, JsonMerger, ResultAggregator, ResultMerger};
pub use backend::{BackendError, WorkerBackend, WorkerCommand, WorkerEvent};
pub use config::{BackoffPolicy, Config, ConfigError};
pub use distributor::{Continuation, DistributeError, TaskDistributor};
pub use instance_manager::{InstanceManager, SpawnError};
pub use local::{EchoHandler, LocalBackend, TaskHandler};
pub use orchestrator::Orchestrator;
pub use recovery::{HealOutcome, RecoveryAction, RecoveryPolicy};
pub use supervision::{diagnose, CycleReport, DiagnosisPolicy, Snapshot, SupervisionLoop};
