//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::clock::{add_duration, SharedClock, SystemClock};
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    history: Vec<HistoryEvent>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    fn info(&self, id: Uuid) -> WorkflowInfo {
        WorkflowInfo {
            id,
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            input: self.input.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            version: self.history.len() as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Internal task state
struct TaskState {
    id: Uuid,
    workflow_id: Uuid,
    payload: TaskPayload,
    status: TaskStatus,
    attempt: u32,
    visible_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TaskState {
    fn new(workflow_id: Uuid, payload: TaskPayload, visible_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            payload,
            status: TaskStatus::Pending,
            attempt: 1,
            visible_at,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
        }
    }

    fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Leased && self.lease_owner.as_deref() == Some(worker_id)
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.visible_at <= now,
            TaskStatus::Leased => self.lease_expires_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// Workflows and tasks behind a single lock so appends stay atomic
#[derive(Default)]
struct StoreState {
    workflows: HashMap<Uuid, WorkflowState>,
    /// Every task ever enqueued; insertion order doubles as queue order for
    /// equal `visible_at`
    tasks: Vec<TaskState>,
    positions: HashMap<Uuid, usize>,
    /// Positions of pending and leased tasks. Settled tasks leave this set,
    /// so claiming never walks completed or canceled work.
    open: BTreeSet<usize>,
}

impl StoreState {
    fn push_task(&mut self, task: TaskState) {
        let index = self.tasks.len();
        self.positions.insert(task.id, index);
        self.open.insert(index);
        self.tasks.push(task);
    }

    fn position(&self, task_id: Uuid) -> Result<usize, StoreError> {
        self.positions
            .get(&task_id)
            .copied()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    fn settle(&mut self, index: usize, status: TaskStatus) {
        let task = &mut self.tasks[index];
        task.status = status;
        task.lease_owner = None;
        task.lease_expires_at = None;
        self.open.remove(&index);
    }

    fn open_tasks(&self, workflow_id: Uuid) -> Vec<usize> {
        self.open
            .iter()
            .copied()
            .filter(|&i| self.tasks[i].workflow_id == workflow_id)
            .collect()
    }

    fn apply_effects(&mut self, workflow_id: Uuid, effects: Vec<TaskEffect>) {
        for effect in effects {
            match effect {
                TaskEffect::Enqueue {
                    payload,
                    visible_at,
                } => self.push_task(TaskState::new(workflow_id, payload, visible_at)),
                TaskEffect::CancelTimer(timer_id) => {
                    for index in self.open_tasks(workflow_id) {
                        if matches!(&self.tasks[index].payload, TaskPayload::Timer { timer_id: id } if *id == timer_id)
                        {
                            self.settle(index, TaskStatus::Canceled);
                        }
                    }
                }
                TaskEffect::EnsureResume => {
                    let pending = self.open_tasks(workflow_id).into_iter().any(|i| {
                        self.tasks[i].status == TaskStatus::Pending
                            && self.tasks[i].payload == TaskPayload::Resume
                    });
                    if !pending {
                        let now = self
                            .workflows
                            .get(&workflow_id)
                            .map(|w| w.updated_at)
                            .unwrap_or_else(Utc::now);
                        self.push_task(TaskState::new(workflow_id, TaskPayload::Resume, now));
                    }
                }
                TaskEffect::CancelAll => {
                    for index in self.open_tasks(workflow_id) {
                        self.settle(index, TaskStatus::Canceled);
                    }
                }
            }
        }
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the SQLite implementation.
///
/// # Example
///
/// ```
/// use photoflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    state: RwLock<StoreState>,
    clock: SharedClock,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that timestamps events and leases with `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            clock,
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        let state = self.state.read();
        state
            .open
            .iter()
            .filter(|&&i| state.tasks[i].status == TaskStatus::Pending)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.workflows.clear();
        state.tasks.clear();
        state.positions.clear();
        state.open.clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.write();
        if state.workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowAlreadyExists(workflow_id));
        }

        state.workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Running,
                input: input.clone(),
                result: None,
                error: None,
                history: vec![HistoryEvent {
                    sequence: 1,
                    recorded_at: now,
                    event: WorkflowEvent::WorkflowStarted {
                        workflow_type: workflow_type.to_string(),
                        input,
                    },
                }],
                created_at: now,
                updated_at: now,
            },
        );
        state.push_task(TaskState::new(workflow_id, TaskPayload::Resume, now));
        Ok(1)
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let state = self.state.read();
        state
            .workflows
            .get(&workflow_id)
            .map(|w| w.info(workflow_id))
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let state = self.state.read();
        let mut workflows: Vec<WorkflowInfo> = state
            .workflows
            .iter()
            .filter(|(_, w)| status.is_none_or(|s| w.status == s))
            .map(|(id, w)| w.info(*id))
            .collect();
        workflows.sort_by_key(|w| (w.created_at, w.id));
        Ok(workflows)
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_version: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.write();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let plan = plan_append(
            workflow_id,
            workflow.history.len() as u64,
            workflow.status,
            expected_version,
            events,
            now,
        )?;

        workflow.history.extend(plan.history);
        workflow.status = plan.status;
        if plan.result.is_some() {
            workflow.result = plan.result;
        }
        if plan.error.is_some() {
            workflow.error = plan.error;
        }
        workflow.updated_at = now;

        state.apply_effects(workflow_id, plan.effects);
        Ok(plan.version)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let state = self.state.read();
        state
            .workflows
            .get(&workflow_id)
            .map(|w| w.history.clone())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = self.clock.now();
        let lease_expires_at = add_duration(now, lease);
        let mut state = self.state.write();

        let mut due: Vec<usize> = state
            .open
            .iter()
            .copied()
            .filter(|&i| state.tasks[i].is_due(now))
            .collect();
        // Stable sort keeps insertion order among equal deadlines
        due.sort_by_key(|&i| state.tasks[i].visible_at);

        let mut claimed = Vec::new();
        for index in due.into_iter().take(limit) {
            let task = &mut state.tasks[index];
            task.status = TaskStatus::Leased;
            task.lease_owner = Some(worker_id.to_string());
            task.lease_expires_at = Some(lease_expires_at);

            claimed.push(ClaimedTask {
                id: task.id,
                workflow_id: task.workflow_id,
                payload: task.payload.clone(),
                attempt: task.attempt,
                lease_expires_at,
            });
        }

        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let index = state.position(task_id)?;
        let task = &state.tasks[index];

        if task.status == TaskStatus::Canceled {
            return Ok(());
        }
        if !task.is_held_by(worker_id) {
            return Err(StoreError::LeaseLost(task_id));
        }
        state.settle(index, TaskStatus::Completed);
        Ok(())
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let index = state.position(task_id)?;
        let task = &mut state.tasks[index];

        if task.status == TaskStatus::Canceled {
            task.last_error = Some(error.to_string());
            return Ok(());
        }
        if !task.is_held_by(worker_id) {
            return Err(StoreError::LeaseLost(task_id));
        }
        task.last_error = Some(error.to_string());
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.visible_at = visible_at;
        task.lease_owner = None;
        task.lease_expires_at = None;
        Ok(())
    }

    async fn extend_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let expires_at = add_duration(self.clock.now(), lease);
        let mut state = self.state.write();
        let index = state.position(task_id)?;
        let task = &mut state.tasks[index];

        if !task.is_held_by(worker_id) {
            return Err(StoreError::LeaseLost(task_id));
        }
        task.lease_expires_at = Some(expires_at);
        Ok(expires_at)
    }

    async fn release_expired_leases(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.write();
        let StoreState { tasks, open, .. } = &mut *state;
        let mut released = 0;

        for &index in open.iter() {
            let task = &mut tasks[index];
            if task.status == TaskStatus::Leased && task.lease_expires_at.is_some_and(|at| at <= now)
            {
                task.status = TaskStatus::Pending;
                task.lease_owner = None;
                task.lease_expires_at = None;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInfo>, StoreError> {
        let state = self.state.read();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.workflow_id == workflow_id)
            .map(|t| TaskInfo {
                id: t.id,
                workflow_id: t.workflow_id,
                payload: t.payload.clone(),
                status: t.status,
                attempt: t.attempt,
                visible_at: t.visible_at,
                last_error: t.last_error.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::workflow::{ActivityOptions, WorkflowSignal};
    use serde_json::json;

    fn store() -> (Arc<ManualClock>, InMemoryWorkflowEventStore) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryWorkflowEventStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();

        let version = store
            .create_workflow(workflow_id, "test_workflow", json!({"key": "value"}))
            .await
            .unwrap();

        assert_eq!(version, 1);
        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(info.version, 1);

        let events = store.load_events(workflow_id).await.unwrap();
        assert!(matches!(
            &events[0].event,
            WorkflowEvent::WorkflowStarted { workflow_type, .. } if workflow_type == "test_workflow"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "t", json!({})).await.unwrap();

        let result = store.create_workflow(workflow_id, "t", json!({})).await;

        assert!(matches!(result, Err(StoreError::WorkflowAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();

        let version = store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::ActivityScheduled {
                    activity_id: "activity-1".to_string(),
                    activity_type: "test_activity".to_string(),
                    input: json!({}),
                    options: ActivityOptions::default(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(version, 2);

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();

        let signal = || WorkflowEvent::SignalReceived {
            signal: WorkflowSignal::new("done", json!({})),
        };
        store.append_events(workflow_id, 1, vec![signal()]).await.unwrap();

        let result = store.append_events(workflow_id, 1, vec![signal()]).await;

        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            })
        ));
        assert_eq!(store.load_events(workflow_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_workflow_rejects_appends() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();
        store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::WorkflowCompleted { result: json!(42) }],
            )
            .await
            .unwrap();

        let result = store
            .append_events(
                workflow_id,
                2,
                vec![WorkflowEvent::WorkflowFailed {
                    error: WorkflowError::new("late"),
                }],
            )
            .await;

        assert!(matches!(result, Err(StoreError::WorkflowTerminated(_))));
        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_timer_task_visible_at_deadline() {
        let (clock, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();
        // Drain the start resume task
        let tasks = store.claim_tasks("w", 10, Duration::from_secs(60)).await.unwrap();
        store.complete_task(tasks[0].id, "w").await.unwrap();

        store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::TimerScheduled {
                    timer_id: "timer-1".into(),
                    duration_ms: 300_000,
                    fire_at: clock.now() + chrono::Duration::minutes(5),
                }],
            )
            .await
            .unwrap();

        assert!(store
            .claim_tasks("w", 10, Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        clock.advance(Duration::from_secs(300));
        let tasks = store.claim_tasks("w", 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].payload,
            TaskPayload::Timer {
                timer_id: "timer-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_timer_cancel_and_terminal_cancel_tasks() {
        let (clock, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();
        store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::TimerScheduled {
                    timer_id: "timer-1".into(),
                    duration_ms: 1_000,
                    fire_at: clock.now(),
                }],
            )
            .await
            .unwrap();
        store
            .append_events(
                workflow_id,
                2,
                vec![WorkflowEvent::TimerCanceled {
                    timer_id: "timer-1".into(),
                }],
            )
            .await
            .unwrap();

        let tasks = store.list_tasks(workflow_id).await.unwrap();
        let timer = tasks
            .iter()
            .find(|t| matches!(t.payload, TaskPayload::Timer { .. }))
            .unwrap();
        assert_eq!(timer.status, TaskStatus::Canceled);

        store
            .append_events(
                workflow_id,
                3,
                vec![WorkflowEvent::WorkflowCanceled {
                    reason: "stop".into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(store.pending_task_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_task_deduplicated() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();

        for version in 1..=3 {
            store
                .append_events(
                    workflow_id,
                    version,
                    vec![WorkflowEvent::SignalReceived {
                        signal: WorkflowSignal::new("s", json!(version)),
                    }],
                )
                .await
                .unwrap();
        }

        let resumes = store
            .list_tasks(workflow_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.payload == TaskPayload::Resume && t.status == TaskStatus::Pending)
            .count();
        assert_eq!(resumes, 1);
    }

    #[tokio::test]
    async fn test_lease_expiry_and_retry() {
        let (clock, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();

        let first = store.claim_tasks("w1", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(store
            .claim_tasks("w2", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        clock.advance(Duration::from_secs(31));
        assert!(matches!(
            store
                .extend_lease(first[0].id, "w1", Duration::from_secs(30))
                .await,
            Ok(_)
        ));
        clock.advance(Duration::from_secs(31));

        assert_eq!(store.release_expired_leases().await.unwrap(), 1);
        let second = store.claim_tasks("w2", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempt, 1);
        assert!(matches!(
            store
                .extend_lease(first[0].id, "w1", Duration::from_secs(30))
                .await,
            Err(StoreError::LeaseLost(_))
        ));

        let retry_at = clock.now() + chrono::Duration::seconds(5);
        store
            .retry_task(second[0].id, "w2", retry_at, "boom")
            .await
            .unwrap();
        assert!(store
            .claim_tasks("w2", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        clock.advance(Duration::from_secs(5));
        let third = store.claim_tasks("w2", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(third[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_settle_released_task() {
        let (clock, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();

        let first = store.claim_tasks("w1", 1, Duration::from_secs(30)).await.unwrap();
        clock.advance(Duration::from_secs(31));
        let second = store.claim_tasks("w2", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second[0].id, first[0].id);

        let retry_at = clock.now();
        assert!(matches!(
            store.retry_task(first[0].id, "w1", retry_at, "late").await,
            Err(StoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store.complete_task(first[0].id, "w1").await,
            Err(StoreError::LeaseLost(_))
        ));

        // w2 still holds the only lease, on the same attempt
        assert!(store
            .claim_tasks("w3", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());
        let task = &store.list_tasks(workflow_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Leased);
        assert_eq!(task.attempt, 1);

        store.complete_task(second[0].id, "w2").await.unwrap();
        assert_eq!(
            store.list_tasks(workflow_id).await.unwrap()[0].status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_canceled_task_settles_quietly() {
        let (_, store) = store();
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "test", json!({})).await.unwrap();
        let claimed = store.claim_tasks("w1", 1, Duration::from_secs(30)).await.unwrap();

        store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::WorkflowCanceled {
                    reason: "stop".into(),
                }],
            )
            .await
            .unwrap();

        store.complete_task(claimed[0].id, "w1").await.unwrap();
        assert_eq!(
            store.list_tasks(workflow_id).await.unwrap()[0].status,
            TaskStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_settled_tasks_leave_open_index() {
        let (_, store) = store();
        for _ in 0..3 {
            store
                .create_workflow(Uuid::now_v7(), "test", json!({}))
                .await
                .unwrap();
        }
        let claimed = store.claim_tasks("w", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(store.state.read().open.len(), 3);

        for task in &claimed {
            store.complete_task(task.id, "w").await.unwrap();
        }

        assert!(store.state.read().open.is_empty());
        assert_eq!(store.state.read().tasks.len(), 3);
        assert_eq!(store.pending_task_count(), 0);
    }
}
