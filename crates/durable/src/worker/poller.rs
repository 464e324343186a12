//! Task polling with exponential backoff
//!
//! Claims due tasks under a lease and stretches the poll interval while the
//! queue is empty.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when tasks are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,

    /// Visibility timeout granted to claimed tasks
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            lease_duration: Duration::from_secs(60),
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the lease granted to claimed tasks
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}

/// Task poller with adaptive backoff
///
/// Polls for tasks with exponential backoff when idle and resets to
/// minimum interval when tasks are found.
pub struct TaskPoller {
    store: Arc<dyn WorkflowEventStore>,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        worker_id: impl Into<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Poll for available tasks
    ///
    /// Returns claimed tasks and updates internal backoff state.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ClaimedTask>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Err(PollerError::Shutdown);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let tasks = self
            .store
            .claim_tasks(&self.worker_id, batch_size, self.config.lease_duration)
            .await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = tasks.len(), "Claimed tasks");
        }

        Ok(tasks)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker shutdown
    #[error("worker is shutting down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, TaskPayload};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0)
            .with_lease_duration(Duration::from_secs(5));

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.lease_duration, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_backoff_grows_when_idle_and_resets() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(200))
            .with_backoff_multiplier(2.0);
        let mut poller = TaskPoller::new(store.clone(), "w1", config, rx);

        assert!(poller.poll(10).await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.poll(10).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(200));

        store
            .create_workflow(Uuid::now_v7(), "t", json!({}))
            .await
            .unwrap();
        let tasks = poller.poll(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload, TaskPayload::Resume);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_poll_after_shutdown() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let (tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(store, "w1", PollerConfig::default(), rx);

        tx.send(true).unwrap();

        assert!(poller.is_shutdown());
        assert!(matches!(poller.poll(1).await, Err(PollerError::Shutdown)));
    }
}
