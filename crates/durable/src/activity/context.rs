//! Activity execution context

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (attempt finished or worker shutting down)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// Carries the identity of the scheduled call, the attempt number, a
/// heartbeat sender that keeps the task lease alive, and a cancellation
/// signal raised when the worker gives up on the attempt (timeout or
/// shutdown).
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for (i, image) in input.images.iter().enumerate() {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::retryable("cancelled"));
///         }
///
///         process(image).await?;
///         ctx.heartbeat(Some(json!({"processed": i + 1}))).await?;
///     }
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Task that carries this attempt
    pub task_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Workflow instance that scheduled this activity
    pub workflow_id: Uuid,

    /// Activity ID within the workflow (`activity-<n>`)
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,
    cancel_rx: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        task_id: Uuid,
        workflow_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            task_id,
            attempt,
            max_attempts,
            workflow_id,
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancel_rx,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Get a handle that can be used to cancel this attempt
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Key that is identical for every attempt of this scheduled call
    ///
    /// Derived from the workflow instance and the deterministic activity ID,
    /// so a retried or re-leased attempt reuses it.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.activity_id)
    }

    /// Record a heartbeat
    ///
    /// Each heartbeat extends the lease on the underlying task so that a
    /// long-running attempt is not handed to another worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt has been cancelled or the heartbeat
    /// channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // The sender lives as long as `self`, so `wait_for` only errs after drop.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity attempt
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    /// Cancel the attempt
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}
