//! Worker pool
//!
//! Scanners feed three bounded queues; one dispatcher per queue hands items
//! to semaphore-limited tasks that call into the engine.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
use super::poller::{PollerConfig, RunnablePoller};
use crate::collaborators::{CollaboratorError, EventBus};
use crate::config::SchedulerConfig;
use crate::engine::{EngineError, ErrorKind, WorkflowEngine};
use crate::events::InboundEvent;
use crate::model::WaitExecution;
use crate::serde_util::duration_millis;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Items processed at once across all queues
    pub max_concurrency: usize,

    /// Capacity of each of the three queues
    pub queue_capacity: usize,

    pub backpressure: BackpressureConfig,

    /// Runnable-execution poll bounds
    pub poller: PollerConfig,

    #[serde(with = "duration_millis")]
    pub wait_scan_interval: Duration,

    #[serde(with = "duration_millis")]
    pub listener_scan_interval: Duration,

    /// Rows fetched per wait or listener scan
    pub scan_batch_size: usize,

    /// Event types to subscribe to; empty means all
    pub event_types: Vec<String>,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_capacity: 1_000,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            wait_scan_interval: Duration::from_secs(30),
            listener_scan_interval: Duration::from_secs(30),
            scan_batch_size: 100,
            event_types: vec![],
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_scan_intervals(mut self, waits: Duration, listeners: Duration) -> Self {
        self.wait_scan_interval = waits;
        self.listener_scan_interval = listeners;
        self
    }

    /// Take scan intervals and batch size from the engine's scheduler settings
    pub fn with_scheduler(mut self, scheduler: &SchedulerConfig) -> Self {
        self.wait_scan_interval = scheduler.wait_scan_interval;
        self.listener_scan_interval = scheduler.listener_scan_interval;
        self.scan_batch_size = scheduler.scan_batch_size.max(1);
        self
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = event_types;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Running,
    /// Finishing in-flight items, taking no new ones
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    InvalidConfig(#[from] BackpressureError),

    #[error("event source error: {0}")]
    EventSource(#[from] CollaboratorError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("queue closed")]
    QueueClosed,

    #[error("graceful shutdown timed out with {0} items in flight")]
    ShutdownTimeout(usize),
}

/// Senders for the three queues; cloned into every producer
#[derive(Clone)]
struct Queues {
    executions: mpsc::Sender<Uuid>,
    waits: mpsc::Sender<WaitExecution>,
    events: mpsc::Sender<InboundEvent>,
}

/// State shared by the dispatchers
#[derive(Clone)]
struct Shared {
    engine: Arc<WorkflowEngine>,
    permits: Arc<Semaphore>,
    backpressure: Arc<BackpressureState>,
    /// Executions queued or being processed by this pool
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl Shared {
    async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

pub struct WorkerPool {
    engine: Arc<WorkflowEngine>,
    events: Option<Arc<dyn EventBus>>,
    config: WorkerPoolConfig,
    shared: Shared,
    queues: RwLock<Option<Queues>>,
    status: RwLock<WorkerPoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(engine: Arc<WorkflowEngine>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Shared {
            engine: engine.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            backpressure: Arc::new(BackpressureState::new(
                config.backpressure.clone(),
                config.max_concurrency,
            )),
            in_flight: Arc::new(DashMap::new()),
        };

        Self {
            engine,
            events: None,
            config,
            shared,
            queues: RwLock::new(None),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Forward events from a bus into the event queue
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.backpressure.in_flight()
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Stopped {
            return Err(WorkerPoolError::AlreadyRunning);
        }
        self.config.backpressure.validate()?;
        self.shutdown_tx.send_replace(false);
        self.shared.in_flight.clear();

        let capacity = self.config.queue_capacity;
        let (executions_tx, executions_rx) = mpsc::channel(capacity);
        let (waits_tx, waits_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let queues = Queues {
            executions: executions_tx,
            waits: waits_tx,
            events: events_tx,
        };

        let event_stream = match &self.events {
            Some(bus) => Some(bus.subscribe(&self.config.event_types).await?),
            None => None,
        };

        info!(
            worker_id = %self.engine.config().worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        let mut handles = self.handles.lock();
        handles.push(self.spawn_runnable_scanner(queues.clone()));
        handles.push(self.spawn_wait_scanner(queues.clone()));
        handles.push(self.spawn_listener_scanner(queues.clone()));
        if let Some(mut stream) = event_stream {
            let events = queues.events.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = stream.next() => match next {
                            Some(event) => {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                warn!("event stream ended");
                                break;
                            }
                        },
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("event forwarder exited");
            }));
        }

        handles.push(spawn_dispatcher(self.shared.clone(), executions_rx, process_execution));
        handles.push(spawn_dispatcher(self.shared.clone(), waits_rx, process_wait));
        handles.push(spawn_dispatcher(self.shared.clone(), events_rx, process_event));
        drop(handles);

        *self.queues.write() = Some(queues);
        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Queue an inbound event for processing
    pub async fn submit_event(&self, event: InboundEvent) -> Result<(), WorkerPoolError> {
        let sender = self.sender(|q| q.events.clone())?;
        sender.send(event).await.map_err(|_| WorkerPoolError::QueueClosed)
    }

    /// Queue an execution to be advanced
    pub async fn submit_execution(&self, execution_id: Uuid) -> Result<(), WorkerPoolError> {
        let sender = self.sender(|q| q.executions.clone())?;
        sender.send(execution_id).await.map_err(|_| WorkerPoolError::QueueClosed)
    }

    fn sender<T>(&self, pick: impl FnOnce(&Queues) -> T) -> Result<T, WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Running {
            return Err(WorkerPoolError::NotRunning);
        }
        self.queues.read().as_ref().map(pick).ok_or(WorkerPoolError::NotRunning)
    }

    /// Stop intake, process what is already queued, and wait for in-flight
    /// items to finish
    ///
    /// Producers stop on the shutdown signal and drop their senders; each
    /// dispatcher then empties its queue and exits.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!("draining worker pool");
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);
        self.queues.write().take();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                let busy = self.config.max_concurrency - self.shared.permits.available_permits();
                warn!(busy, "shutdown timeout reached with queued items");
                return Err(WorkerPoolError::ShutdownTimeout(busy.max(1)));
            }
        }

        loop {
            let busy = self.config.max_concurrency - self.shared.permits.available_permits();
            if busy == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(busy, "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout(busy));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    // =========================================================================
    // Scanners
    // =========================================================================

    fn spawn_runnable_scanner(&self, queues: Queues) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut poller = RunnablePoller::new(
            self.engine.clone(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }
                let slots = shared.backpressure.available_slots();
                if shared.backpressure.should_accept() && slots > 0 {
                    match poller.poll(slots).await {
                        Ok(ids) => {
                            for id in ids {
                                if shared.in_flight.insert(id, ()).is_some() {
                                    continue;
                                }
                                if queues.executions.send(id).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "runnable poll failed"),
                    }
                }
                if poller.wait().await {
                    break;
                }
            }
            debug!("runnable scanner exited");
        })
    }

    fn spawn_wait_scanner(&self, queues: Queues) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let shared = self.shared.clone();
        let limit = self.config.scan_batch_size;
        let interval = self.config.wait_scan_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.due_waits(limit).await {
                            Ok(waits) => {
                                if !enqueue_waits(&shared, &queues, waits).await {
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "due wait scan failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("wait scanner exited");
        })
    }

    fn spawn_listener_scanner(&self, queues: Queues) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let shared = self.shared.clone();
        let limit = self.config.scan_batch_size;
        let interval = self.config.listener_scan_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.expire_listeners(limit).await {
                            Ok(waits) => {
                                if !waits.is_empty() {
                                    info!(count = waits.len(), "listeners expired");
                                }
                                if !enqueue_waits(&shared, &queues, waits).await {
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "listener expiry scan failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("listener scanner exited");
        })
    }
}

/// Queue due waits whose execution is not already in flight here
async fn enqueue_waits(shared: &Shared, queues: &Queues, waits: Vec<WaitExecution>) -> bool {
    for wait in waits {
        if shared.in_flight.insert(wait.workflow_execution_id, ()).is_some() {
            continue;
        }
        if queues.waits.send(wait).await.is_err() {
            return false;
        }
    }
    true
}

// =============================================================================
// Dispatch
// =============================================================================

/// Hand queued items to tasks until every sender is gone and the queue is empty
fn spawn_dispatcher<T, F, Fut>(shared: Shared, mut rx: mpsc::Receiver<T>, process: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(Shared, T) -> Fut + Copy + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let Some(permit) = shared.permit().await else {
                break;
            };

            shared.backpressure.started();
            let worker = shared.clone();
            tokio::spawn(async move {
                let backpressure = worker.backpressure.clone();
                process(worker, item).await;
                backpressure.finished();
                drop(permit);
            });
        }
    })
}

fn log_failure(error: &EngineError, message: &str) {
    match error.kind() {
        ErrorKind::Concurrency | ErrorKind::Precondition | ErrorKind::Expiry => {
            debug!(error = %error, code = error.error_code(), "{message}")
        }
        ErrorKind::Transient => warn!(error = %error, code = error.error_code(), "{message}"),
        _ => error!(error = %error, code = error.error_code(), "{message}"),
    }
}

async fn process_execution(shared: Shared, execution_id: Uuid) {
    match shared.engine.run_execution(execution_id).await {
        Ok(outcome) => debug!(%execution_id, ?outcome, "execution driven"),
        Err(e) => log_failure(&e, "execution not driven"),
    }
    shared.in_flight.remove(&execution_id);
}

async fn process_wait(shared: Shared, wait: WaitExecution) {
    let execution_id = wait.workflow_execution_id;
    match shared.engine.process_due_wait(&wait).await {
        Ok(outcome) => debug!(wait_id = %wait.id, ?outcome, "due wait processed"),
        Err(e) => log_failure(&e, "due wait not processed"),
    }
    shared.in_flight.remove(&execution_id);
}

async fn process_event(shared: Shared, event: InboundEvent) {
    match shared.engine.handle_event(&event).await {
        Ok(outcome) => debug!(event_id = %event.id, ?outcome, "event processed"),
        Err(e) => log_failure(&e, "event not processed"),
    }
}
