//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - Main worker pool with concurrent task execution
//! - [`TaskDispatcher`] - Runs activity, timer and resume tasks
//! - [`PollerConfig`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────────────┐        ┌─────────────────────────┐  │
//! │  │     TaskPoller      │        │      Lease Sweeper      │  │
//! │  │ (claim with lease)  │        │         (30s)           │  │
//! │  └──────────┬──────────┘        └─────────────────────────┘  │
//! │             │                                                │
//! │             ▼                                                │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        TaskDispatcher (Semaphore-limited)           │    │
//! │  │  activity: execute + retry policy                   │    │
//! │  │  timer:    record TimerFired                        │    │
//! │  │  resume:   replay, persist new commands             │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use photoflow_durable::worker::{TaskDispatcher, WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new()
//!     .with_worker_id("gallery-worker-1")
//!     .with_max_concurrency(20);
//!
//! let dispatcher = TaskDispatcher::new(executor, activities, &config.worker_id, config.poller.lease_duration);
//! let pool = WorkerPool::new(store, dispatcher, config);
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod dispatcher;
mod poller;
mod pool;

pub use dispatcher::{DispatchError, DispatchOutcome, TaskDispatcher};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
