//! Worker pool for task execution
//!
//! Manages concurrent task execution with lease sweeping and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::dispatcher::TaskDispatcher;
use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::persistence::{StoreError, WorkflowEventStore};
use crate::reliability::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// How often expired leases are returned to the queue
    #[serde(with = "duration_millis")]
    pub lease_sweep_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            lease_sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set the lease granted to claimed tasks
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.poller.lease_duration = lease;
        self
    }

    /// Set lease sweep interval
    pub fn with_lease_sweep_interval(mut self, interval: Duration) -> Self {
        self.lease_sweep_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool executing activity, timer and resume tasks
///
/// # Example
///
/// ```ignore
/// use photoflow_durable::worker::{TaskDispatcher, WorkerPool, WorkerPoolConfig};
///
/// let dispatcher = TaskDispatcher::new(executor, activities, "worker-1", lease);
/// let pool = WorkerPool::new(store, dispatcher, WorkerPoolConfig::new().with_max_concurrency(20));
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowEventStore>,
    dispatcher: Arc<TaskDispatcher>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        dispatcher: TaskDispatcher,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            store,
            dispatcher: Arc::new(dispatcher),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(vec![]),
        }
    }

    /// Start the poll and lease sweep loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            lease_ms = self.config.poller.lease_duration.as_millis() as u64,
            "Starting worker pool"
        );

        let poll = self.spawn_poll_loop();
        let sweep = self.spawn_sweep_loop();
        self.handles.lock().extend([poll, sweep]);
        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops polling and waits up to `shutdown_timeout` for in-flight tasks.
    /// Tasks still running after that keep their lease until it expires and
    /// are then picked up by another worker.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        let all_permits = self.config.max_concurrency as u32;
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.active_tasks.acquire_many(all_permits),
        )
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;

        match drained {
            Ok(_) => {
                info!(worker_id = %self.config.worker_id, "Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    remaining_tasks = self.config.max_concurrency - self.active_tasks.available_permits(),
                    "Shutdown timeout reached"
                );
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of tasks currently executing
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim due tasks once and run them to completion
    ///
    /// Returns the number of tasks dispatched. Used by tests and by callers
    /// that drive the pool without background loops.
    pub async fn run_once(&self) -> Result<usize, WorkerPoolError> {
        let tasks = self
            .store
            .claim_tasks(
                &self.config.worker_id,
                self.config.max_concurrency,
                self.config.poller.lease_duration,
            )
            .await?;
        let count = tasks.len();

        let results = join_all(tasks.into_iter().map(|task| self.dispatcher.dispatch(task))).await;
        for result in results {
            if let Err(e) = result {
                error!("Task dispatch failed: {}", e);
            }
        }

        Ok(count)
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let mut poller = TaskPoller::new(
            Arc::clone(&self.store),
            self.config.worker_id.clone(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );
        let dispatcher = Arc::clone(&self.dispatcher);
        let active_tasks = Arc::clone(&self.active_tasks);

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_tasks.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    // Unstarted tasks come back when their lease expires
                                    debug!(task_id = %task.id, "No permits available");
                                    break;
                                }
                            };

                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                let task_id = task.id;
                                if let Err(e) = dispatcher.dispatch(task).await {
                                    error!(%task_id, "Task dispatch failed: {}", e);
                                }
                                drop(permit);
                            });
                        }
                    }
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.lease_sweep_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.release_expired_leases().await {
                            Ok(0) => {}
                            Ok(released) => info!(count = released, "Released expired leases"),
                            Err(e) => error!("Lease sweep failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweep loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Sweep loop exited");
        })
    }
}
