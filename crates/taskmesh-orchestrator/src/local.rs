//! In-process worker backend.
//!
//! Each worker is a tokio task that heartbeats on a fixed interval, runs
//! assigned payloads through a [`TaskHandler`] and reports back over the
//! shared [`WorkerEvent`] channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskmesh_core::{FaultKind, TaskId, WorkerId, WorkerInstance};

use crate::backend::{
    BackendError, WorkerBackend, WorkerCommand, WorkerEvent, DISPATCH_CHANNEL_CAPACITY,
};

/// Capacity of the shared worker -> orchestrator event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs one task payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Return the contribution, or an error message. Implementations should
    /// stop early once `cancel` fires.
    async fn handle(
        &self,
        worker_id: &WorkerId,
        payload: &str,
        cancel: CancellationToken,
    ) -> Result<String, String>;
}

/// Echoes the payload back after a fixed delay.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    delay: Duration,
}

impl EchoHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(
        &self,
        _worker_id: &WorkerId,
        payload: &str,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            _ = tokio::time::sleep(self.delay) => Ok(payload.to_string()),
        }
    }
}

struct LocalWorker {
    stop: CancellationToken,
    heartbeats_suspended: Arc<AtomicBool>,
}

/// Backend running workers as tokio tasks in this process.
pub struct LocalBackend {
    handler: Arc<dyn TaskHandler>,
    events: mpsc::Sender<WorkerEvent>,
    heartbeat_interval: Duration,
    max_in_flight: usize,
    workers: Mutex<HashMap<WorkerId, LocalWorker>>,
}

impl LocalBackend {
    /// Create the backend and the event stream the orchestrator consumes.
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        heartbeat_interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerEvent>) {
        Self::with_max_in_flight(handler, heartbeat_interval, usize::MAX)
    }

    /// Like [`new`](Self::new), reporting ResourceExhaustion when a worker
    /// holds more than `max_in_flight` running tasks.
    pub fn with_max_in_flight(
        handler: Arc<dyn TaskHandler>,
        heartbeat_interval: Duration,
        max_in_flight: usize,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let backend = Arc::new(Self {
            handler,
            events,
            heartbeat_interval,
            max_in_flight,
            workers: Mutex::new(HashMap::new()),
        });
        (backend, events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, LocalWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop sending heartbeats for a worker while it keeps running tasks.
    pub fn suspend_heartbeats(&self, worker_id: &WorkerId) -> bool {
        self.set_heartbeats(worker_id, true)
    }

    pub fn resume_heartbeats(&self, worker_id: &WorkerId) -> bool {
        self.set_heartbeats(worker_id, false)
    }

    fn set_heartbeats(&self, worker_id: &WorkerId, suspended: bool) -> bool {
        match self.lock().get(worker_id) {
            Some(worker) => {
                worker
                    .heartbeats_suspended
                    .store(suspended, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Start (or restart) the worker loop and return its command channel.
    fn start(&self, worker_id: &WorkerId) -> mpsc::Sender<WorkerCommand> {
        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let suspended = {
            let mut workers = self.lock();
            let suspended = workers
                .get(worker_id)
                .map(|w| w.heartbeats_suspended.clone())
                .unwrap_or_default();
            let previous = workers.insert(
                worker_id.clone(),
                LocalWorker {
                    stop: stop.clone(),
                    heartbeats_suspended: suspended.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.stop.cancel();
            }
            suspended
        };

        let worker = WorkerLoop {
            worker_id: worker_id.clone(),
            commands: rx,
            events: self.events.clone(),
            handler: self.handler.clone(),
            heartbeat_interval: self.heartbeat_interval,
            max_in_flight: self.max_in_flight,
            heartbeats_suspended: suspended,
            stop,
        };
        tokio::spawn(worker.run());
        tx
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn launch(
        &self,
        instance: &WorkerInstance,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError> {
        info!(worker_id = %instance.id, kind = %instance.kind, "Launching local worker");
        Ok(self.start(&instance.id))
    }

    async fn probe(&self, worker_id: &WorkerId) -> Result<(), BackendError> {
        match self.lock().get(worker_id) {
            Some(worker) if !worker.stop.is_cancelled() => Ok(()),
            Some(_) => Err(BackendError::ProbeFailed(format!("{worker_id} stopped"))),
            None => Err(BackendError::UnknownWorker(worker_id.clone())),
        }
    }

    async fn reconnect(
        &self,
        worker_id: &WorkerId,
    ) -> Result<mpsc::Sender<WorkerCommand>, BackendError> {
        if !self.lock().contains_key(worker_id) {
            return Err(BackendError::UnknownWorker(worker_id.clone()));
        }
        info!(worker_id = %worker_id, "Restarting local worker loop");
        Ok(self.start(worker_id))
    }

    async fn shutdown(&self, worker_id: &WorkerId) {
        if let Some(worker) = self.lock().remove(worker_id) {
            worker.stop.cancel();
        }
    }
}

struct WorkerLoop {
    worker_id: WorkerId,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    handler: Arc<dyn TaskHandler>,
    heartbeat_interval: Duration,
    max_in_flight: usize,
    heartbeats_suspended: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl WorkerLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskId>();
        let mut running: HashMap<TaskId, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.heartbeats_suspended.load(Ordering::SeqCst) {
                        let heartbeat = WorkerEvent::Heartbeat {
                            worker_id: self.worker_id.clone(),
                            at: Utc::now(),
                        };
                        if self.events.try_send(heartbeat).is_err() {
                            debug!(worker_id = %self.worker_id, "Heartbeat dropped");
                        }
                    }
                }
                Some(task_id) = done_rx.recv() => {
                    running.remove(&task_id);
                }
                command = self.commands.recv() => match command {
                    None => break,
                    Some(WorkerCommand::Execute { assignment, payload }) => {
                        let task_id = assignment.task_id.clone();
                        if running.len() >= self.max_in_flight {
                            let _ = self.events.try_send(WorkerEvent::Fault {
                                worker_id: self.worker_id.clone(),
                                kind: FaultKind::ResourceExhaustion,
                                detail: format!("{} tasks in flight", running.len()),
                            });
                        }
                        let cancel = CancellationToken::new();
                        if let Some(previous) = running.insert(task_id.clone(), cancel.clone()) {
                            previous.cancel();
                        }
                        debug!(
                            worker_id = %self.worker_id,
                            task_id = %task_id,
                            attempt = assignment.attempt,
                            "Executing task"
                        );
                        tokio::spawn(execute(
                            self.worker_id.clone(),
                            task_id,
                            payload,
                            self.handler.clone(),
                            self.events.clone(),
                            cancel,
                            done_tx.clone(),
                        ));
                    }
                    Some(WorkerCommand::Cancel { task_id }) => {
                        if let Some(cancel) = running.remove(&task_id) {
                            debug!(
                                worker_id = %self.worker_id,
                                task_id = %task_id,
                                "Cancelling task"
                            );
                            cancel.cancel();
                        }
                    }
                    Some(WorkerCommand::Shutdown { force }) => {
                        if force {
                            for cancel in running.values() {
                                cancel.cancel();
                            }
                        }
                        info!(worker_id = %self.worker_id, force, "Local worker shutting down");
                        break;
                    }
                },
            }
        }

        if !running.is_empty() {
            warn!(
                worker_id = %self.worker_id,
                in_flight = running.len(),
                "Worker loop exited with tasks in flight"
            );
        }
    }
}

async fn execute(
    worker_id: WorkerId,
    task_id: TaskId,
    payload: String,
    handler: Arc<dyn TaskHandler>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    done: mpsc::UnboundedSender<TaskId>,
) {
    let outcome = handler.handle(&worker_id, &payload, cancel.clone()).await;
    if !cancel.is_cancelled() {
        let event = match outcome {
            Ok(result) => WorkerEvent::Completed {
                task_id: task_id.clone(),
                worker_id,
                result,
            },
            Err(error) => WorkerEvent::Failed {
                task_id: task_id.clone(),
                worker_id,
                error,
            },
        };
        let _ = events.send(event).await;
    }
    let _ = done.send(task_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use taskmesh_core::TaskAssignment;

    fn assignment(worker_id: &WorkerId, task: &str) -> TaskAssignment {
        TaskAssignment {
            task_id: TaskId::new(task),
            worker_id: worker_id.clone(),
            assigned_at: Utc::now(),
            attempt: 1,
        }
    }

    async fn next_non_heartbeat(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
        loop {
            match rx.recv().await {
                Some(WorkerEvent::Heartbeat { .. }) => continue,
                Some(event) => return event,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reports_completion() {
        let handler = Arc::new(EchoHandler::new(Duration::from_millis(50)));
        let (backend, mut events) = LocalBackend::new(handler, Duration::from_secs(1));
        let instance = WorkerInstance::new("local", BTreeMap::new());
        let tx = backend.launch(&instance).await.unwrap();
        backend.probe(&instance.id).await.unwrap();

        tx.send(WorkerCommand::Execute {
            assignment: assignment(&instance.id, "t1"),
            payload: "hello".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            next_non_heartbeat(&mut events).await,
            WorkerEvent::Completed {
                task_id: TaskId::new("t1"),
                worker_id: instance.id.clone(),
                result: "hello".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_limit_reports_exhaustion() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(60)));
        let (backend, mut events) =
            LocalBackend::with_max_in_flight(handler, Duration::from_secs(1), 1);
        let instance = WorkerInstance::new("local", BTreeMap::new());
        let tx = backend.launch(&instance).await.unwrap();

        for task in ["t1", "t2"] {
            tx.send(WorkerCommand::Execute {
                assignment: assignment(&instance.id, task),
                payload: "slow".to_string(),
            })
            .await
            .unwrap();
        }

        assert!(matches!(
            next_non_heartbeat(&mut events).await,
            WorkerEvent::Fault {
                kind: FaultKind::ResourceExhaustion,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_can_be_suspended() {
        let handler = Arc::new(EchoHandler::new(Duration::from_millis(1)));
        let (backend, mut events) = LocalBackend::new(handler, Duration::from_secs(1));
        let instance = WorkerInstance::new("local", BTreeMap::new());
        backend.launch(&instance).await.unwrap();

        assert!(matches!(events.recv().await, Some(WorkerEvent::Heartbeat { .. })));

        assert!(backend.suspend_heartbeats(&instance.id));
        tokio::time::sleep(Duration::from_millis(10)).await;
        while events.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_report() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(10)));
        let (backend, mut events) = LocalBackend::new(handler, Duration::from_secs(60));
        let instance = WorkerInstance::new("local", BTreeMap::new());
        let tx = backend.launch(&instance).await.unwrap();

        tx.send(WorkerCommand::Execute {
            assignment: assignment(&instance.id, "t1"),
            payload: "slow".to_string(),
        })
        .await
        .unwrap();
        tx.send(WorkerCommand::Cancel {
            task_id: TaskId::new("t1"),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, WorkerEvent::Heartbeat { .. }));
        }
    }

    #[tokio::test]
    async fn test_probe_and_reconnect_unknown_worker() {
        let handler = Arc::new(EchoHandler::new(Duration::from_millis(1)));
        let (backend, _events) = LocalBackend::new(handler, Duration::from_secs(1));
        let ghost = WorkerId::new("ghost");

        assert_eq!(
            backend.probe(&ghost).await,
            Err(BackendError::UnknownWorker(ghost.clone()))
        );
        assert!(backend.reconnect(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let handler = Arc::new(EchoHandler::new(Duration::from_millis(1)));
        let (backend, _events) = LocalBackend::new(handler, Duration::from_secs(1));
        let instance = WorkerInstance::new("local", BTreeMap::new());
        let tx = backend.launch(&instance).await.unwrap();

        backend.shutdown(&instance.id).await;
        tx.closed().await;
        assert!(backend.probe(&instance.id).await.is_err());
    }
}
