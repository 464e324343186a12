//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflows
//! - Resuming workflows by replaying their history
//! - Recording activity outcomes, timer firings and signals
//! - Canceling workflows

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{replay, ReplayError, ReplayStatus};
use crate::activity::ActivityError;
use crate::clock::{SharedClock, SystemClock};
use crate::persistence::{StoreError, WorkflowEventStore, WorkflowStatus};
use crate::workflow::{
    terminal_event, HistoryEvent, Workflow, WorkflowCommand, WorkflowEvent, WorkflowSignal,
};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,

    /// How many times an append is re-derived after losing a version race
    pub max_conflict_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
            max_conflict_retries: 8,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_events_per_workflow(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// History cannot be replayed
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow type not registered
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// Workflow already reached a terminal state
    #[error("workflow {0} already completed")]
    WorkflowCompleted(Uuid),

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Appends kept losing version races
    #[error("workflow {0}: gave up after repeated concurrency conflicts")]
    ConflictRetriesExhausted(Uuid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Result of resuming a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOutcome {
    /// Status after the resume
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Commands derived by this resume
    pub commands: Vec<WorkflowCommand>,
}

impl ResumeOutcome {
    fn unchanged(status: WorkflowStatus) -> Self {
        Self {
            status,
            events_written: 0,
            commands: vec![],
        }
    }
}

/// What happened to a single-event append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Appended {
    Written,
    /// History already held the outcome
    Skipped,
    /// Workflow ended before the append
    Terminated,
}

/// Workflow executor
///
/// The executor replays workflow definitions against their stored history
/// and persists the commands they derive. Concurrent writers are detected
/// by the store's version check; a loser reloads history and derives again.
///
/// # Example
///
/// ```ignore
/// use photoflow_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut registry = WorkflowRegistry::new();
/// registry.register(MyWorkflow);
/// let executor = WorkflowExecutor::new(store, registry);
///
/// let workflow_id = executor.start::<MyWorkflow>(input).await?;
/// executor.signal(workflow_id, "approved", json!({})).await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowEventStore>,
    registry: WorkflowRegistry,
    clock: SharedClock,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor with the given store and definitions
    pub fn new(store: Arc<dyn WorkflowEventStore>, registry: WorkflowRegistry) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config: ExecutorConfig::default(),
        }
    }

    /// Use `clock` for timer deadlines
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Set custom config
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.registry.register(workflow);
        info!(workflow_type = W::TYPE, "registered workflow type");
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Start a new workflow by type name
    ///
    /// Creates the instance with its `WorkflowStarted` event and performs the
    /// initial resume. Once the instance exists its id is always returned; a
    /// failed inline resume is left to the resume task queued at creation.
    #[instrument(skip(self, input))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            warn!(%workflow_type, "cannot start unregistered workflow type");
            return Err(ExecutorError::DefinitionNotFound(workflow_type.to_string()));
        }

        let workflow_id = Uuid::now_v7();
        self.store
            .create_workflow(workflow_id, workflow_type, input)
            .await?;
        info!(%workflow_id, %workflow_type, "started workflow");

        if let Err(e) = self.resume(workflow_id).await {
            warn!(%workflow_id, error = %e, "initial resume failed; deferring to resume task");
        }
        Ok(workflow_id)
    }

    /// Start a new workflow with a typed input
    pub async fn start<W: Workflow>(&self, input: W::Input) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start_workflow(W::TYPE, input).await
    }

    /// Replay a workflow and persist the commands it derives
    ///
    /// Idempotent: resuming a workflow whose history has not changed writes
    /// nothing. A determinism violation fails the workflow.
    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: Uuid) -> Result<ResumeOutcome, ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.load_events(workflow_id).await?;
            if let Some(event) = terminal_event(&history) {
                debug!(%workflow_id, event = event.event_type(), "workflow already in terminal state");
                return Ok(ResumeOutcome::unchanged(terminal_status(event)));
            }

            if history.len() > self.config.max_events_per_workflow {
                return Err(ExecutorError::TooManyEvents(
                    workflow_id,
                    history.len(),
                    self.config.max_events_per_workflow,
                ));
            }

            let workflow_type = match history.first().map(|entry| &entry.event) {
                Some(WorkflowEvent::WorkflowStarted { workflow_type, .. }) => workflow_type.clone(),
                _ => return Err(ReplayError::MissingStart(workflow_id).into()),
            };
            let definition = self.registry.get(&workflow_type)?;

            let version = history.len() as u64;
            let outcome = replay(definition.as_ref(), workflow_id, history)?;

            if let Some(violation) = &outcome.violation {
                error!(
                    %workflow_id,
                    %workflow_type,
                    sequence = violation.sequence,
                    recorded = %violation.recorded,
                    derived = %violation.derived,
                    "determinism violation; failing workflow"
                );
            }

            let status = match &outcome.status {
                ReplayStatus::Suspended => WorkflowStatus::Running,
                ReplayStatus::Completed(_) => WorkflowStatus::Completed,
                ReplayStatus::Failed(_) => WorkflowStatus::Failed,
            };

            if outcome.commands.is_empty() {
                return Ok(ResumeOutcome::unchanged(status));
            }

            let now = self.clock.now();
            let events: Vec<WorkflowEvent> = outcome
                .commands
                .iter()
                .cloned()
                .map(|command| command.into_event(now))
                .collect();
            let events_written = events.len();

            match self.store.append_events(workflow_id, version, events).await {
                Ok(new_version) => {
                    debug!(%workflow_id, new_version, %status, "persisted derived commands");
                    if status.is_terminal() {
                        info!(%workflow_id, %status, "workflow finished");
                    }
                    return Ok(ResumeOutcome {
                        status,
                        events_written,
                        commands: outcome.commands,
                    });
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    debug!(%workflow_id, expected, actual, "lost append race; replaying again");
                }
                Err(StoreError::WorkflowTerminated(_)) => {
                    let status = self.store.get_workflow_status(workflow_id).await?;
                    return Ok(ResumeOutcome::unchanged(status));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ExecutorError::ConflictRetriesExhausted(workflow_id))
    }

    /// Deliver a signal to a workflow
    ///
    /// The signal is buffered in history even if the workflow is not waiting
    /// on `channel` yet. Fails with `WorkflowCompleted` once the workflow
    /// has ended.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        workflow_id: Uuid,
        channel: &str,
        payload: Value,
    ) -> Result<(), ExecutorError> {
        let signal = WorkflowSignal::new(channel, payload);
        let appended = self
            .append_with_retry(workflow_id, |_| {
                Some(vec![WorkflowEvent::SignalReceived {
                    signal: signal.clone(),
                }])
            })
            .await?;

        if appended == Appended::Terminated {
            warn!(%workflow_id, %channel, "cannot signal completed workflow");
            return Err(ExecutorError::WorkflowCompleted(workflow_id));
        }

        info!(%workflow_id, %channel, "signal received");
        Ok(())
    }

    /// Cancel a workflow
    ///
    /// Appends `WorkflowCanceled`; open tasks of the workflow are dropped.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: Uuid, reason: &str) -> Result<(), ExecutorError> {
        let appended = self
            .append_with_retry(workflow_id, |_| {
                Some(vec![WorkflowEvent::WorkflowCanceled {
                    reason: reason.to_string(),
                }])
            })
            .await?;

        if appended == Appended::Terminated {
            return Err(ExecutorError::WorkflowCompleted(workflow_id));
        }

        info!(%workflow_id, %reason, "workflow canceled");
        Ok(())
    }

    /// Record a successful activity result
    ///
    /// Duplicate completions (e.g. after a lease expired mid-execution) are
    /// ignored; the first recorded outcome is final.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        result: Value,
    ) -> Result<(), ExecutorError> {
        let appended = self
            .append_with_retry(workflow_id, |history| {
                activity_pending(history, activity_id).then(|| {
                    vec![WorkflowEvent::ActivityCompleted {
                        activity_id: activity_id.to_string(),
                        result: result.clone(),
                    }]
                })
            })
            .await?;

        debug!(%workflow_id, %activity_id, ?appended, "activity completion recorded");
        Ok(())
    }

    /// Record that an activity failed permanently
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        error: ActivityError,
        attempts: u32,
    ) -> Result<(), ExecutorError> {
        let appended = self
            .append_with_retry(workflow_id, |history| {
                activity_pending(history, activity_id).then(|| {
                    vec![WorkflowEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        error: error.clone(),
                        attempts,
                    }]
                })
            })
            .await?;

        debug!(%workflow_id, %activity_id, attempts, ?appended, "activity failure recorded");
        Ok(())
    }

    /// Record that a timer fired
    ///
    /// No-op when the timer was canceled or already fired.
    #[instrument(skip(self))]
    pub async fn on_timer_fired(&self, workflow_id: Uuid, timer_id: &str) -> Result<(), ExecutorError> {
        let appended = self
            .append_with_retry(workflow_id, |history| {
                timer_pending(history, timer_id).then(|| {
                    vec![WorkflowEvent::TimerFired {
                        timer_id: timer_id.to_string(),
                    }]
                })
            })
            .await?;

        debug!(%workflow_id, %timer_id, ?appended, "timer fire handled");
        Ok(())
    }

    /// Whether an activity still awaits its outcome
    pub async fn is_activity_pending(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
    ) -> Result<bool, ExecutorError> {
        let history = self.store.load_events(workflow_id).await?;
        Ok(terminal_event(&history).is_none() && activity_pending(&history, activity_id))
    }

    /// Load history
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        Ok(self.store.load_events(workflow_id).await?)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Append the events `derive` returns for the current history
    ///
    /// `derive` runs again on every version conflict; returning `None`
    /// skips the append.
    async fn append_with_retry<F>(
        &self,
        workflow_id: Uuid,
        mut derive: F,
    ) -> Result<Appended, ExecutorError>
    where
        F: FnMut(&[HistoryEvent]) -> Option<Vec<WorkflowEvent>> + Send,
    {
        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.load_events(workflow_id).await?;
            if terminal_event(&history).is_some() {
                return Ok(Appended::Terminated);
            }
            let Some(events) = derive(&history) else {
                return Ok(Appended::Skipped);
            };

            match self
                .store
                .append_events(workflow_id, history.len() as u64, events)
                .await
            {
                Ok(_) => return Ok(Appended::Written),
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    debug!(%workflow_id, expected, actual, "lost append race; retrying");
                }
                Err(StoreError::WorkflowTerminated(_)) => return Ok(Appended::Terminated),
                Err(err) => return Err(err.into()),
            }
        }

        Err(ExecutorError::ConflictRetriesExhausted(workflow_id))
    }
}

fn terminal_status(event: &WorkflowEvent) -> WorkflowStatus {
    match event {
        WorkflowEvent::WorkflowCompleted { .. } => WorkflowStatus::Completed,
        WorkflowEvent::WorkflowCanceled { .. } => WorkflowStatus::Canceled,
        _ => WorkflowStatus::Failed,
    }
}

/// Scheduled and not yet resolved
fn activity_pending(history: &[HistoryEvent], activity_id: &str) -> bool {
    let mut scheduled = false;
    for entry in history {
        match &entry.event {
            WorkflowEvent::ActivityScheduled { activity_id: id, .. } if id == activity_id => {
                scheduled = true
            }
            WorkflowEvent::ActivityCompleted { activity_id: id, .. }
            | WorkflowEvent::ActivityFailed { activity_id: id, .. }
                if id == activity_id =>
            {
                return false
            }
            _ => {}
        }
    }
    scheduled
}

/// Scheduled, not fired and not canceled
fn timer_pending(history: &[HistoryEvent], timer_id: &str) -> bool {
    let mut scheduled = false;
    for entry in history {
        match &entry.event {
            WorkflowEvent::TimerScheduled { timer_id: id, .. } if id == timer_id => {
                scheduled = true
            }
            WorkflowEvent::TimerFired { timer_id: id } | WorkflowEvent::TimerCanceled { timer_id: id }
                if id == timer_id =>
            {
                return false
            }
            _ => {}
        }
    }
    scheduled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, TaskInfo, TaskPayload, TaskStatus, WorkflowInfo,
    };
    use crate::workflow::{ActivityOptions, Awaitable, Resolution, WorkflowContext, WorkflowResult};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReviewInput {
        document: String,
    }

    /// check -> wait for "approved" or 1 hour
    struct ReviewWorkflow;

    impl Workflow for ReviewWorkflow {
        const TYPE: &'static str = "review";
        type Input = ReviewInput;
        type Output = String;

        fn run(&self, ctx: &mut WorkflowContext, input: ReviewInput) -> WorkflowResult<String> {
            let check = ctx.schedule_activity("check", json!(input.document), ActivityOptions::default())?;
            ctx.await_activity(&check)??;

            let deadline = ctx.start_timer(Duration::from_secs(3600))?;
            let selected = ctx.select(&[Awaitable::signal("approved"), Awaitable::from(&deadline)])?;
            match selected.resolution {
                Resolution::Signal(signal) => {
                    ctx.cancel_timer(&deadline)?;
                    Ok(format!("approved by {}", signal.payload["by"].as_str().unwrap_or("?")))
                }
                _ => Ok("expired".to_string()),
            }
        }
    }

    fn executor() -> (Arc<ManualClock>, Arc<InMemoryWorkflowEventStore>, WorkflowExecutor) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryWorkflowEventStore::with_clock(clock.clone()));
        let mut registry = WorkflowRegistry::new();
        registry.register(ReviewWorkflow);
        let executor = WorkflowExecutor::new(store.clone(), registry).with_clock(clock.clone());
        (clock, store, executor)
    }

    fn input() -> ReviewInput {
        ReviewInput {
            document: "doc-1".into(),
        }
    }

    #[tokio::test]
    async fn test_start_workflow() {
        let (_, store, executor) = executor();

        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        let status = store.get_workflow_status(workflow_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Running);

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, WorkflowEvent::WorkflowStarted { .. }));
        assert!(matches!(
            &events[1].event,
            WorkflowEvent::ActivityScheduled { activity_id, .. } if activity_id == "activity-1"
        ));
    }

    #[tokio::test]
    async fn test_unknown_definition() {
        let (_, _, executor) = executor();

        let result = executor.start_workflow("missing", json!({})).await;

        assert!(matches!(result, Err(ExecutorError::DefinitionNotFound(t)) if t == "missing"));
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let (_, store, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        let outcome = executor.resume(workflow_id).await.unwrap();

        assert_eq!(outcome.events_written, 0);
        assert_eq!(store.load_events(workflow_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_buffered() {
        let (_, store, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        executor
            .signal(workflow_id, "approved", json!({"by": "ana"}))
            .await
            .unwrap();
        executor.resume(workflow_id).await.unwrap();
        assert_eq!(
            store.get_workflow_status(workflow_id).await.unwrap(),
            WorkflowStatus::Running
        );

        executor
            .on_activity_completed(workflow_id, "activity-1", json!(true))
            .await
            .unwrap();
        let outcome = executor.resume(workflow_id).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Completed);
        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.result, Some(json!("approved by ana")));

        // Timer was started and canceled in the same resume
        let history = store.load_events(workflow_id).await.unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(e.event, WorkflowEvent::TimerCanceled { .. })));
    }

    #[tokio::test]
    async fn test_timer_fires_when_no_signal() {
        let (clock, store, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();
        executor
            .on_activity_completed(workflow_id, "activity-1", json!(true))
            .await
            .unwrap();
        executor.resume(workflow_id).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        executor.on_timer_fired(workflow_id, "timer-1").await.unwrap();
        // Second delivery of the same timer task is ignored
        executor.on_timer_fired(workflow_id, "timer-1").await.unwrap();
        let outcome = executor.resume(workflow_id).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Completed);
        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.result, Some(json!("expired")));
        let fired = store
            .load_events(workflow_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::TimerFired { .. }))
            .count();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn test_duplicate_activity_completion_ignored() {
        let (_, store, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        executor
            .on_activity_completed(workflow_id, "activity-1", json!(1))
            .await
            .unwrap();
        executor
            .on_activity_completed(workflow_id, "activity-1", json!(2))
            .await
            .unwrap();

        let completions: Vec<_> = store
            .load_events(workflow_id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.event {
                WorkflowEvent::ActivityCompleted { result, .. } => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(completions, vec![json!(1)]);
        assert!(!executor
            .is_activity_pending(workflow_id, "activity-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_activity_failure_fails_workflow() {
        let (_, store, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        executor
            .on_activity_failed(
                workflow_id,
                "activity-1",
                ActivityError::non_retryable("document missing"),
                1,
            )
            .await
            .unwrap();
        let outcome = executor.resume(workflow_id).await.unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert!(info.error.unwrap().message.contains("document missing"));
    }

    #[tokio::test]
    async fn test_cannot_signal_completed_workflow() {
        let (_, _, executor) = executor();
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();
        executor.cancel(workflow_id, "withdrawn").await.unwrap();

        let result = executor.signal(workflow_id, "approved", json!({})).await;

        assert!(matches!(result, Err(ExecutorError::WorkflowCompleted(id)) if id == workflow_id));
        assert!(matches!(
            executor.cancel(workflow_id, "again").await,
            Err(ExecutorError::WorkflowCompleted(_))
        ));
    }

    #[tokio::test]
    async fn test_signal_unknown_workflow() {
        let (_, _, executor) = executor();

        let result = executor.signal(Uuid::now_v7(), "approved", json!({})).await;

        assert!(matches!(result, Err(ExecutorError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_resumes_write_once() {
        let (_, store, executor) = executor();
        let executor = Arc::new(executor);
        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();
        executor
            .on_activity_completed(workflow_id, "activity-1", json!(true))
            .await
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.resume(workflow_id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let timers = store
            .load_events(workflow_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::TimerScheduled { .. }))
            .count();
        assert_eq!(timers, 1);
    }

    /// Delegates to the in-memory store but rejects the first append
    struct FailFirstAppend {
        inner: InMemoryWorkflowEventStore,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl WorkflowEventStore for FailFirstAppend {
        async fn create_workflow(
            &self,
            workflow_id: Uuid,
            workflow_type: &str,
            input: Value,
        ) -> Result<u64, StoreError> {
            self.inner.create_workflow(workflow_id, workflow_type, input).await
        }

        async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
            self.inner.get_workflow_info(workflow_id).await
        }

        async fn list_workflows(
            &self,
            status: Option<WorkflowStatus>,
        ) -> Result<Vec<WorkflowInfo>, StoreError> {
            self.inner.list_workflows(status).await
        }

        async fn append_events(
            &self,
            workflow_id: Uuid,
            expected_version: u64,
            events: Vec<WorkflowEvent>,
        ) -> Result<u64, StoreError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Database("disk I/O error".into()));
            }
            self.inner.append_events(workflow_id, expected_version, events).await
        }

        async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
            self.inner.load_events(workflow_id).await
        }

        async fn claim_tasks(
            &self,
            worker_id: &str,
            limit: usize,
            lease: Duration,
        ) -> Result<Vec<ClaimedTask>, StoreError> {
            self.inner.claim_tasks(worker_id, limit, lease).await
        }

        async fn complete_task(&self, task_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
            self.inner.complete_task(task_id, worker_id).await
        }

        async fn retry_task(
            &self,
            task_id: Uuid,
            worker_id: &str,
            visible_at: DateTime<Utc>,
            error: &str,
        ) -> Result<(), StoreError> {
            self.inner.retry_task(task_id, worker_id, visible_at, error).await
        }

        async fn extend_lease(
            &self,
            task_id: Uuid,
            worker_id: &str,
            lease: Duration,
        ) -> Result<DateTime<Utc>, StoreError> {
            self.inner.extend_lease(task_id, worker_id, lease).await
        }

        async fn release_expired_leases(&self) -> Result<usize, StoreError> {
            self.inner.release_expired_leases().await
        }

        async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInfo>, StoreError> {
            self.inner.list_tasks(workflow_id).await
        }
    }

    #[tokio::test]
    async fn test_start_returns_id_when_initial_resume_fails() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(FailFirstAppend {
            inner: InMemoryWorkflowEventStore::with_clock(clock.clone()),
            failed: Default::default(),
        });
        let mut registry = WorkflowRegistry::new();
        registry.register(ReviewWorkflow);
        let executor = WorkflowExecutor::new(store.clone(), registry).with_clock(clock);

        let workflow_id = executor.start::<ReviewWorkflow>(input()).await.unwrap();

        // Only the start event made it; the queued resume task carries on
        assert_eq!(store.load_events(workflow_id).await.unwrap().len(), 1);
        let tasks = store.list_tasks(workflow_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload, TaskPayload::Resume);
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        executor.resume(workflow_id).await.unwrap();
        let events = store.load_events(workflow_id).await.unwrap();
        assert!(matches!(events[1].event, WorkflowEvent::ActivityScheduled { .. }));
        assert_eq!(store.inner.workflow_count(), 1);
    }
}
