//! Execution of claimed tasks
//!
//! A claimed task is one of three kinds:
//! - activity: run one attempt, then record the outcome or requeue with backoff
//! - timer: record `TimerFired` unless the timer was canceled meanwhile
//! - resume: replay the workflow and persist the commands it derives

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityContext, ActivityError, ActivityRegistry, CancellationHandle};
use crate::clock::add_duration;
use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::{ClaimedTask, StoreError, TaskPayload, WorkflowEventStore, WorkflowStatus};
use crate::reliability::{RetryDecision, RetryPolicy};
use crate::workflow::ActivityOptions;

/// What the dispatcher did with a task
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Activity succeeded and its result was recorded
    ActivityCompleted,

    /// Activity attempt failed and the task was requeued
    ActivityRetrying { next_attempt: u32, delay: Duration },

    /// Activity failed permanently and `ActivityFailed` was recorded
    ActivityFailed,

    /// Timer fire recorded (or ignored because the timer was canceled)
    TimerHandled,

    /// Workflow replayed
    Resumed(WorkflowStatus),

    /// Task no longer relevant (outcome already recorded, workflow ended,
    /// or the lease passed to another worker)
    Skipped,
}

/// Dispatch errors; the task has been requeued when one is returned
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Executor error
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Executes claimed tasks against the executor and activity registry
pub struct TaskDispatcher {
    executor: Arc<WorkflowExecutor>,
    activities: Arc<ActivityRegistry>,
    worker_id: String,
    lease_duration: Duration,
    /// Backoff for resume/timer tasks whose bookkeeping failed
    requeue_policy: RetryPolicy,
}

impl TaskDispatcher {
    /// Create a new dispatcher
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        activities: Arc<ActivityRegistry>,
        worker_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            executor,
            activities,
            worker_id: worker_id.into(),
            lease_duration,
            requeue_policy: RetryPolicy::new(u32::MAX, Duration::from_secs(1), 2.0)
                .with_max_interval(Duration::from_secs(60)),
        }
    }

    /// Get the executor
    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    /// Execute a claimed task and settle it in the store
    #[instrument(skip(self, task), fields(task_id = %task.id, workflow_id = %task.workflow_id, kind = task.payload.kind(), attempt = task.attempt))]
    pub async fn dispatch(&self, task: ClaimedTask) -> Result<DispatchOutcome, DispatchError> {
        let result = match &task.payload {
            TaskPayload::Activity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                self.run_activity(&task, activity_id, activity_type, input.clone(), options)
                    .await
            }
            TaskPayload::Timer { timer_id } => self.fire_timer(&task, timer_id).await,
            TaskPayload::Resume => self.resume(&task).await,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(DispatchError::Store(StoreError::LeaseLost(_))) => {
                warn!("lease expired before the task was settled; leaving it to its new holder");
                Ok(DispatchOutcome::Skipped)
            }
            Err(DispatchError::Executor(
                ExecutorError::WorkflowNotFound(_) | ExecutorError::WorkflowCompleted(_),
            )) => match self.complete(&task).await {
                Ok(()) | Err(StoreError::LeaseLost(_)) => Ok(DispatchOutcome::Skipped),
                Err(e) => Err(e.into()),
            },
            Err(err) => {
                let delay = self.requeue_policy.delay_after_attempt(task.attempt);
                warn!(error = %err, ?delay, "task bookkeeping failed; requeueing");
                let visible_at = add_duration(self.executor.clock().now(), delay);
                match self.requeue(&task, visible_at, &err.to_string()).await {
                    Ok(()) => Err(err),
                    Err(StoreError::LeaseLost(_)) => Ok(DispatchOutcome::Skipped),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        self.executor.store()
    }

    async fn complete(&self, task: &ClaimedTask) -> Result<(), StoreError> {
        self.store().complete_task(task.id, &self.worker_id).await
    }

    async fn requeue(
        &self,
        task: &ClaimedTask,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.store()
            .retry_task(task.id, &self.worker_id, visible_at, error)
            .await
    }

    async fn resume(&self, task: &ClaimedTask) -> Result<DispatchOutcome, DispatchError> {
        let outcome = self.executor.resume(task.workflow_id).await?;
        self.complete(task).await?;
        Ok(DispatchOutcome::Resumed(outcome.status))
    }

    async fn fire_timer(
        &self,
        task: &ClaimedTask,
        timer_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.executor
            .on_timer_fired(task.workflow_id, timer_id)
            .await?;
        self.complete(task).await?;
        Ok(DispatchOutcome::TimerHandled)
    }

    async fn run_activity(
        &self,
        task: &ClaimedTask,
        activity_id: &str,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        // A re-leased task may find its outcome already recorded
        if !self
            .executor
            .is_activity_pending(task.workflow_id, activity_id)
            .await?
        {
            debug!(%activity_id, "activity already resolved; skipping");
            self.complete(task).await?;
            return Ok(DispatchOutcome::Skipped);
        }

        let policy = &options.retry_policy;
        let result = self
            .execute_attempt(task, activity_id, activity_type, input, options)
            .await;

        match result {
            Ok(output) => {
                self.executor
                    .on_activity_completed(task.workflow_id, activity_id, output)
                    .await?;
                self.complete(task).await?;
                debug!(%activity_id, %activity_type, "activity completed");
                Ok(DispatchOutcome::ActivityCompleted)
            }
            Err(error) => match policy.decide(task.attempt, &error) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    let visible_at = add_duration(self.executor.clock().now(), delay);
                    self.requeue(task, visible_at, &error.to_string()).await?;
                    info!(
                        %activity_id,
                        %activity_type,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "activity attempt failed; retry scheduled"
                    );
                    Ok(DispatchOutcome::ActivityRetrying {
                        next_attempt,
                        delay,
                    })
                }
                RetryDecision::GiveUp => {
                    warn!(
                        %activity_id,
                        %activity_type,
                        attempts = task.attempt,
                        error = %error,
                        "activity failed permanently"
                    );
                    self.executor
                        .on_activity_failed(task.workflow_id, activity_id, error, task.attempt)
                        .await?;
                    self.complete(task).await?;
                    Ok(DispatchOutcome::ActivityFailed)
                }
            },
        }
    }

    /// Run one attempt under `start_to_close_timeout`, turning heartbeats into
    /// lease extensions
    async fn execute_attempt(
        &self,
        task: &ClaimedTask,
        activity_id: &str,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> Result<Value, ActivityError> {
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
        let ctx = ActivityContext::new(
            task.id,
            task.workflow_id,
            activity_id,
            task.attempt,
            options.retry_policy.max_attempts,
        )
        .with_heartbeat(heartbeat_tx);
        let cancellation = ctx.cancellation_handle();

        let timeout = options.start_to_close_timeout;
        let execution = tokio::time::timeout(timeout, self.activities.execute(activity_type, ctx, input));
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => {
                    return match result {
                        Ok(result) => result,
                        Err(_) => {
                            cancellation.cancel();
                            Err(ActivityError::timeout(timeout))
                        }
                    };
                }
                Some(_) = heartbeat_rx.recv() => {
                    self.extend_lease(task.id, &cancellation).await;
                }
            }
        }
    }

    async fn extend_lease(&self, task_id: Uuid, cancellation: &CancellationHandle) {
        match self
            .store()
            .extend_lease(task_id, &self.worker_id, self.lease_duration)
            .await
        {
            Ok(expires_at) => debug!(%task_id, %expires_at, "lease extended"),
            Err(StoreError::LeaseLost(_)) => {
                warn!(%task_id, "lease lost; cancelling attempt");
                cancellation.cancel();
            }
            Err(err) => warn!(%task_id, error = %err, "failed to extend lease"),
        }
    }
}
