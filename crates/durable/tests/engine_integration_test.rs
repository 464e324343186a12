//! End-to-end tests for the engine, the worker pool and both store backends
//!
//! Run with: cargo test -p photoflow-durable --test engine_integration_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use photoflow_durable::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use photoflow_durable::clock::ManualClock;
use photoflow_durable::persistence::{
    InMemoryWorkflowEventStore, SqliteWorkflowEventStore, TaskPayload, TaskStatus,
    WorkflowEventStore, WorkflowStatus,
};
use photoflow_durable::workflow::{
    ActivityOptions, Awaitable, Resolution, Workflow, WorkflowContext, WorkflowEvent,
    WorkflowResult,
};
use photoflow_durable::{
    RetryPolicy, TaskDispatcher, WorkerPool, WorkerPoolConfig, WorkflowClient, WorkflowExecutor,
    WorkflowRegistry,
};

// ============================================
// Fixtures
// ============================================

/// Always fails with a retryable error
struct Charge {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Activity for Charge {
    const TYPE: &'static str = "charge";
    type Input = u64;
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, amount: u64) -> Result<String, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::retryable(format!("gateway unavailable for {amount}")))
    }
}

struct Echo;

#[async_trait]
impl Activity for Echo {
    const TYPE: &'static str = "echo";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, input: String) -> Result<String, ActivityError> {
        Ok(input)
    }
}

/// Charges once and falls back when the charge fails permanently
struct CheckoutWorkflow;

impl Workflow for CheckoutWorkflow {
    const TYPE: &'static str = "checkout";
    type Input = u64;
    type Output = String;

    fn run(&self, ctx: &mut WorkflowContext, amount: u64) -> WorkflowResult<String> {
        let options = ActivityOptions::default()
            .with_retry(RetryPolicy::new(3, Duration::from_secs(5), 2.0));
        match ctx.execute_activity::<Charge>(&amount, options)? {
            Ok(receipt) => Ok(receipt),
            Err(e) => Ok(format!("fallback: {}", e.message)),
        }
    }
}

/// Echoes its input, then waits for "stop" or five minutes
struct WatchWorkflow;

impl Workflow for WatchWorkflow {
    const TYPE: &'static str = "watch";
    type Input = String;
    type Output = String;

    fn run(&self, ctx: &mut WorkflowContext, input: String) -> WorkflowResult<String> {
        let echoed = ctx.execute_activity::<Echo>(&input, ActivityOptions::default())??;
        let deadline = ctx.start_timer(Duration::from_secs(300))?;
        let selected = ctx.select(&[Awaitable::signal("stop"), Awaitable::from(&deadline)])?;
        match selected.resolution {
            Resolution::Signal(_) => {
                ctx.cancel_timer(&deadline)?;
                Ok(format!("{echoed}: stopped"))
            }
            _ => Ok(format!("{echoed}: expired")),
        }
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<dyn WorkflowEventStore>,
    client: WorkflowClient,
    pool: WorkerPool,
    charge_calls: Arc<AtomicU32>,
}

impl Harness {
    fn new(clock: Arc<ManualClock>, store: Arc<dyn WorkflowEventStore>) -> Self {
        let mut registry = WorkflowRegistry::new();
        registry.register(CheckoutWorkflow).register(WatchWorkflow);
        let executor =
            Arc::new(WorkflowExecutor::new(store.clone(), registry).with_clock(clock.clone()));

        let charge_calls = Arc::new(AtomicU32::new(0));
        let mut activities = ActivityRegistry::new();
        activities
            .register(Charge {
                calls: charge_calls.clone(),
            })
            .register(Echo);

        let config = WorkerPoolConfig::new()
            .with_worker_id("it-worker")
            .with_lease_duration(Duration::from_secs(30));
        let dispatcher = TaskDispatcher::new(
            executor.clone(),
            Arc::new(activities),
            config.worker_id.clone(),
            config.poller.lease_duration,
        );

        Self {
            clock,
            store: store.clone(),
            client: WorkflowClient::new(executor),
            pool: WorkerPool::new(store, dispatcher, config),
            charge_calls,
        }
    }

    fn in_memory() -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryWorkflowEventStore::with_clock(clock.clone()));
        Self::new(clock, store)
    }

    async fn sqlite() -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = SqliteWorkflowEventStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
            .with_clock(clock.clone());
        Self::new(clock, Arc::new(store))
    }

    /// Run every task that is due right now
    async fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            let n = self.pool.run_once().await.unwrap();
            if n == 0 {
                return handled;
            }
            handled += n;
        }
    }
}

// ============================================
// Retry Timing
// ============================================

#[test_log::test(tokio::test)]
async fn test_retry_schedule_then_fallback_sqlite() {
    let h = Harness::sqlite().await;
    let id = h.client.create::<CheckoutWorkflow>(42).await.unwrap();

    h.drain().await;
    assert_eq!(h.charge_calls.load(Ordering::SeqCst), 1);

    // Second attempt is due 5s after the first
    h.clock.advance(Duration::from_secs(4));
    assert_eq!(h.drain().await, 0);
    h.clock.advance(Duration::from_secs(1));
    h.drain().await;
    assert_eq!(h.charge_calls.load(Ordering::SeqCst), 2);

    // Third attempt 10s after the second
    h.clock.advance(Duration::from_secs(9));
    assert_eq!(h.drain().await, 0);
    h.clock.advance(Duration::from_secs(1));
    h.drain().await;
    assert_eq!(h.charge_calls.load(Ordering::SeqCst), 3);

    let status = h.client.get_instance_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(
        status.result,
        Some(json!("fallback: gateway unavailable for 42"))
    );

    let history = h.client.get_history(id).await.unwrap();
    let failures: Vec<_> = history
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::ActivityFailed { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![3]);

    // No further attempts once the failure is recorded
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.drain().await, 0);
    assert_eq!(h.charge_calls.load(Ordering::SeqCst), 3);
}

// ============================================
// Timers and Signals
// ============================================

#[test_log::test(tokio::test)]
async fn test_signal_cancels_timer_sqlite() {
    let h = Harness::sqlite().await;
    let id = h.client.create::<WatchWorkflow>("cam".into()).await.unwrap();
    h.drain().await;

    h.clock.advance(Duration::from_secs(120));
    h.client.signal_instance(id, "stop", json!({})).await.unwrap();

    h.clock.advance(Duration::from_secs(600));
    h.drain().await;

    let status = h.client.get_instance_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.result, Some(json!("cam: stopped")));

    let history = h.client.get_history(id).await.unwrap();
    assert!(history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerCanceled { .. })));
    assert!(!history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerFired { .. })));

    let tasks = h.store.list_tasks(id).await.unwrap();
    let timer = tasks
        .iter()
        .find(|t| matches!(t.payload, TaskPayload::Timer { .. }))
        .unwrap();
    assert_eq!(timer.status, TaskStatus::Canceled);
}

#[test_log::test(tokio::test)]
async fn test_timer_expires_without_signal() {
    let h = Harness::in_memory();
    let id = h.client.create::<WatchWorkflow>("cam".into()).await.unwrap();
    h.drain().await;

    h.clock.advance(Duration::from_secs(299));
    h.drain().await;
    assert_eq!(
        h.client.get_instance_status(id).await.unwrap().status,
        WorkflowStatus::Running
    );

    h.clock.advance(Duration::from_secs(1));
    h.drain().await;

    let status = h.client.get_instance_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.result, Some(json!("cam: expired")));

    // A late signal is rejected
    assert!(h.client.signal_instance(id, "stop", json!({})).await.is_err());
}

// ============================================
// Lease Recovery
// ============================================

#[test_log::test(tokio::test)]
async fn test_crashed_worker_tasks_are_redelivered() {
    let h = Harness::in_memory();
    let id = h.client.create::<WatchWorkflow>("cam".into()).await.unwrap();

    // A worker claims everything and never reports back
    let stolen = h
        .store
        .claim_tasks("crashed-worker", 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!stolen.is_empty());
    assert_eq!(h.drain().await, 0);

    h.clock.advance(Duration::from_secs(31));
    assert!(h.drain().await > 0);

    let history = h.client.get_history(id).await.unwrap();
    assert!(history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::ActivityCompleted { .. })));
    assert!(history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerScheduled { .. })));
}
