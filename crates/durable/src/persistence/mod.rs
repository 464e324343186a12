//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for history and task queue persistence
//! - [`InMemoryWorkflowEventStore`] for testing
//! - [`SqliteWorkflowEventStore`] for single-node deployments

mod memory;
mod sqlite;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use sqlite::SqliteWorkflowEventStore;
pub use store::{
    ClaimedTask, StoreError, TaskInfo, TaskPayload, TaskStatus, WorkflowEventStore, WorkflowInfo,
    WorkflowStatus, CANCELED_ERROR_CODE,
};
