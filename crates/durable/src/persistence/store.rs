//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

/// Error code stored on instances ended by cancellation
pub const CANCELED_ERROR_CODE: &str = "canceled";

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow ID already used
    #[error("workflow already exists: {0}")]
    WorkflowAlreadyExists(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task is no longer leased by the caller
    #[error("lease lost on task {0}")]
    LeaseLost(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// History already ended; nothing may be appended
    #[error("workflow {0} already reached a terminal event")]
    WorkflowTerminated(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is running (possibly suspended)
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was canceled
    Canceled,
}

impl WorkflowStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether no further events may be appended
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting until `visible_at`
    Pending,
    /// Held by a worker until its lease expires
    Leased,
    Completed,
    Canceled,
}

impl TaskStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            other => Err(StoreError::Serialization(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Work item carried by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Execute one attempt of an activity
    Activity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Fire a durable timer (visible at its deadline)
    Timer { timer_id: String },

    /// Replay the instance to derive new commands
    Resume,
}

impl TaskPayload {
    /// Short name for logs and queries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Activity { .. } => "activity",
            Self::Timer { .. } => "timer",
            Self::Resume => "resume",
        }
    }
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub payload: TaskPayload,
    /// 1-based attempt number
    pub attempt: u32,
    pub lease_expires_at: DateTime<Utc>,
}

/// Task as seen by inspection queries
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub attempt: u32,
    pub visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Workflow information stored in the database
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Number of events in history
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for workflow history and the task queue
///
/// Implementations must be thread-safe and support concurrent access.
/// `append_events` is the only way to change an instance, and it updates
/// the task queue in the same atomic write:
///
/// | appended event      | queue effect                                   |
/// |---------------------|------------------------------------------------|
/// | `ActivityScheduled` | activity task, attempt 1, visible now          |
/// | `TimerScheduled`    | timer task, visible at `fire_at`               |
/// | `TimerCanceled`     | cancels that timer's open task                 |
/// | any resolution      | one pending resume task per instance           |
/// | any terminal event  | cancels every open task of the instance        |
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a new workflow instance
    ///
    /// Appends `WorkflowStarted` as event 1 and enqueues a resume task.
    /// Returns the new version (1).
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Get workflow status
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        Ok(self.get_workflow_info(workflow_id).await?.status)
    }

    /// List workflows, optionally filtered by status, oldest first
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append events to a workflow (with optimistic concurrency)
    ///
    /// Fails with `ConcurrencyConflict` when `expected_version` is not the
    /// current version and with `WorkflowTerminated` once a terminal event
    /// exists. Returns the new version after appending.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_version: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError>;

    /// Load the full history of a workflow (for replay)
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Lease up to `limit` due tasks
    ///
    /// Due means pending with `visible_at <= now`, or leased with an expired
    /// lease. Each claimed task is leased to `worker_id` until `now + lease`.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Mark a task done
    ///
    /// Only the current lease holder may settle a task; anyone else gets
    /// `LeaseLost`. Completing a task that was canceled meanwhile is a no-op.
    async fn complete_task(&self, task_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Requeue a task for its next attempt at `visible_at`
    ///
    /// Same ownership rule as `complete_task`.
    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Extend the lease `worker_id` holds on a task
    ///
    /// Returns the new expiry, or `LeaseLost` if the task is no longer
    /// leased to `worker_id`.
    async fn extend_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Return tasks with expired leases to the pending state
    async fn release_expired_leases(&self) -> Result<usize, StoreError>;

    /// List the tasks of a workflow, oldest first
    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInfo>, StoreError>;
}

// =============================================================================
// Append planning shared by the adapters
// =============================================================================

/// Queue change implied by an append
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskEffect {
    Enqueue {
        payload: TaskPayload,
        visible_at: DateTime<Utc>,
    },
    CancelTimer(String),
    EnsureResume,
    CancelAll,
}

/// Everything an adapter must write for one append
#[derive(Debug, Clone)]
pub(crate) struct AppendPlan {
    pub version: u64,
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub history: Vec<HistoryEvent>,
    pub effects: Vec<TaskEffect>,
}

/// Validate an append against the current instance state and derive its writes
pub(crate) fn plan_append(
    workflow_id: Uuid,
    current_version: u64,
    current_status: WorkflowStatus,
    expected_version: u64,
    events: Vec<WorkflowEvent>,
    now: DateTime<Utc>,
) -> Result<AppendPlan, StoreError> {
    if current_status.is_terminal() {
        return Err(StoreError::WorkflowTerminated(workflow_id));
    }
    if current_version != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            expected: expected_version,
            actual: current_version,
        });
    }
    if let Some(position) = events.iter().position(|e| e.is_terminal()) {
        if position + 1 != events.len() {
            return Err(StoreError::WorkflowTerminated(workflow_id));
        }
    }

    let mut status = WorkflowStatus::Running;
    let mut result = None;
    let mut error = None;
    let mut effects = Vec::new();
    let mut needs_resume = false;

    for event in &events {
        match event {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
            } => effects.push(TaskEffect::Enqueue {
                payload: TaskPayload::Activity {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                },
                visible_at: now,
            }),
            WorkflowEvent::TimerScheduled {
                timer_id, fire_at, ..
            } => effects.push(TaskEffect::Enqueue {
                payload: TaskPayload::Timer {
                    timer_id: timer_id.clone(),
                },
                visible_at: *fire_at,
            }),
            WorkflowEvent::TimerCanceled { timer_id } => {
                effects.push(TaskEffect::CancelTimer(timer_id.clone()))
            }
            WorkflowEvent::WorkflowCompleted { result: output } => {
                status = WorkflowStatus::Completed;
                result = Some(output.clone());
            }
            WorkflowEvent::WorkflowFailed { error: failure } => {
                status = WorkflowStatus::Failed;
                error = Some(failure.clone());
            }
            WorkflowEvent::WorkflowCanceled { reason } => {
                status = WorkflowStatus::Canceled;
                error = Some(WorkflowError::new(reason.clone()).with_code(CANCELED_ERROR_CODE));
            }
            event if event.is_resolution() => needs_resume = true,
            _ => {}
        }
    }

    if status.is_terminal() {
        effects = vec![TaskEffect::CancelAll];
    } else if needs_resume {
        effects.push(TaskEffect::EnsureResume);
    }

    let history = events
        .into_iter()
        .enumerate()
        .map(|(i, event)| HistoryEvent {
            sequence: current_version + i as u64 + 1,
            recorded_at: now,
            event,
        })
        .collect::<Vec<_>>();

    Ok(AppendPlan {
        version: current_version + history.len() as u64,
        status,
        result,
        error,
        history,
        effects,
    })
}
