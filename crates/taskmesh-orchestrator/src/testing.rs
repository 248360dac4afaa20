//! Test doubles and wiring shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taskmesh_core::{WorkerId, WorkerInstance};

use crate::aggregator::ResultAggregator;
use crate::audit::AuditTrail;
use crate::backend::{BackendError, WorkerBackend, WorkerCommand, DISPATCH_CHANNEL_CAPACITY};
use crate::config::{BackoffPolicy, Config};
use crate::distributor::TaskDistributor;
use crate::faults::FaultInbox;
use crate::instance_manager::InstanceManager;
use crate::recovery::RecoveryPolicy;
use crate::state::Stores;
use crate::supervision::SupervisionLoop;

/// Backend that keeps each worker's command receiver for inspection.
#[derive(Default)]
pub(crate) struct StubBackend {
    receivers: Mutex<HashMap<WorkerId, mpsc::Receiver<WorkerCommand>>>,
    fail_probes: AtomicBool,
    reconnect_failures: AtomicU32,
    reconnect_calls: AtomicU32,
    shutdowns: Mutex<Vec<WorkerId>>,
}

impl StubBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` reconnects fail.
    pub(crate) fn fail_reconnects(&self, count: u32) {
        self.reconnect_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn reconnect_calls(&self) -> u32 {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    /// Drop the worker's receiver so its channel reads as closed.
    pub(crate) fn close(&self, worker_id: &WorkerId) {
        self.receivers.lock().unwrap().remove(worker_id);
    }

    /// Every command queued for the worker so far.
    pub(crate) fn drain_commands(&self, worker_id: &WorkerId) -> Vec<WorkerCommand> {
        let mut receivers = self.receivers.lock().unwrap();
        let mut commands = Vec::new();
        if let Some(rx) = receivers.get_mut(worker_id) {
            while let Ok(command) = rx.try_recv() {
                commands.push(command);
            }
        }
        commands
    }

    pub(crate) fn shutdowns(&self) -> Vec<WorkerId> {
        self.shutdowns.lock().unwrap().clone()
    }

    fn open(&self, worker_id: &WorkerId) -> mpsc::Sender<WorkerCommand> {
        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
        self.receivers.lock().unwrap().insert(worker_id.clone(), rx);
        tx
    }
}

#[async_trait]
impl WorkerBackend for StubBackend {
    async fn launch(
        &self,
        instance: &WorkerInstance,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError> {
        Ok(self.open(&instance.id))
    }

    async fn probe(&self, _worker_id: &WorkerId) -> Result<(), BackendError> {
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(BackendError::ProbeFailed("stub refused".to_string()));
        }
        Ok(())
    }

    async fn reconnect(
        &self,
        worker_id: &WorkerId,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.reconnect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reconnect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unreachable(worker_id.to_string()));
        }
        Ok(self.open(worker_id))
    }

    async fn shutdown(&self, worker_id: &WorkerId) {
        self.receivers.lock().unwrap().remove(worker_id);
        self.shutdowns.lock().unwrap().push(worker_id.clone());
    }
}

/// Small timeouts so tests stay fast.
pub(crate) fn test_config() -> Config {
    Config {
        max_instances: 4,
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(5),
        cycle_interval: Duration::from_secs(1),
        grace_period: Duration::from_secs(10),
        stale_task_threshold: Duration::from_secs(30),
        aggregation_ttl: Duration::from_secs(60),
        probe_timeout: Duration::from_secs(1),
        max_retained_aggregations: 100,
        max_queued_tasks: 100,
        reconnect: BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 3,
        },
        http_bind_addr: "127.0.0.1:0".to_string(),
    }
}

/// Components wired over shared stores and a stub backend.
pub(crate) struct Harness {
    pub inbox: Arc<FaultInbox>,
    pub audit: Arc<AuditTrail>,
    pub backend: Arc<StubBackend>,
    pub manager: InstanceManager,
    pub distributor: TaskDistributor,
    pub aggregator: ResultAggregator,
    pub recovery: Arc<RecoveryPolicy>,
    pub supervision: Arc<SupervisionLoop>,
}

pub(crate) fn harness(config: Config) -> Harness {
    let config = Arc::new(config);
    let stores = Stores::new();
    let inbox = Arc::new(FaultInbox::new());
    let audit = Arc::new(AuditTrail::new());
    let backend = StubBackend::new();
    let dyn_backend: Arc<dyn WorkerBackend> = backend.clone();

    let manager = InstanceManager::new(
        stores.clone(),
        dyn_backend.clone(),
        inbox.clone(),
        audit.clone(),
        config.clone(),
    );
    let distributor = TaskDistributor::new(stores.clone(), inbox.clone(), audit.clone());
    let aggregator = ResultAggregator::new(stores.clone(), inbox.clone(), config.clone());
    let recovery = Arc::new(RecoveryPolicy::new(
        manager.clone(),
        distributor.clone(),
        aggregator.clone(),
        dyn_backend,
        config.clone(),
    ));
    let supervision = Arc::new(SupervisionLoop::new(
        stores,
        inbox.clone(),
        audit.clone(),
        aggregator.clone(),
        distributor.clone(),
        recovery.clone(),
        config,
    ));

    Harness {
        inbox,
        audit,
        backend,
        manager,
        distributor,
        aggregator,
        recovery,
        supervision,
    }
}
