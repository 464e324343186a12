//! # Durable Execution Engine
//!
//! An event-sourced workflow orchestration engine. Workflow code is plain,
//! deterministic Rust that is replayed against its recorded history; every
//! side effect goes through an activity executed by a worker.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is an appended event, so
//!   an instance survives crashes and restarts by replay
//! - **Durable timers and signals**: timers are queued tasks, signals are
//!   buffered in history until the workflow waits on them
//! - **Automatic retries**: per-activity retry policies with exponential backoff
//! - **Lease-based task queue**: at-least-once execution across many workers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              WorkflowClient / WorkflowExecutor               │
//! │  (creates instances, replays history, appends new events)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (in-memory or SQLite: instances, events, task queue)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (claims tasks, runs activities, fires timers, resumes)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use photoflow_durable::prelude::*;
//!
//! struct Greeting;
//!
//! impl Workflow for Greeting {
//!     const TYPE: &'static str = "greeting";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn run(&self, ctx: &mut WorkflowContext, name: String) -> WorkflowResult<String> {
//!         let reply = ctx.execute_activity::<Greet>(&name, ActivityOptions::default())??;
//!         let deadline = ctx.start_timer(Duration::from_secs(60))?;
//!         match ctx.select(&[Awaitable::signal("ack"), Awaitable::from(&deadline)])?.resolution {
//!             Resolution::Signal(_) => ctx.cancel_timer(&deadline)?,
//!             _ => {}
//!         }
//!         Ok(reply)
//!     }
//! }
//!
//! let store = Arc::new(InMemoryWorkflowEventStore::new());
//! let mut registry = WorkflowRegistry::new();
//! registry.register(Greeting);
//! let client = WorkflowClient::new(Arc::new(WorkflowExecutor::new(store, registry)));
//! let id = client.create::<Greeting>("world".into()).await?;
//! ```

pub mod activity;
pub mod client;
pub mod clock;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::client::{InstanceStatus, WorkflowClient};
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, SqliteWorkflowEventStore, StoreError,
        WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{TaskDispatcher, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, Awaitable, Resolution, Workflow, WorkflowContext, WorkflowError,
        WorkflowEvent, WorkflowResult, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use client::{InstanceStatus, WorkflowClient};
pub use engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowEventStore, SqliteWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{TaskDispatcher, WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Awaitable, Resolution, Workflow, WorkflowContext, WorkflowError,
    WorkflowEvent, WorkflowResult, WorkflowSignal,
};
