//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which advances
//! workflows by replaying their history and persisting derived commands.

mod executor;
mod registry;
mod replay;

pub use executor::{ExecutorConfig, ExecutorError, ResumeOutcome, WorkflowExecutor};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use replay::{replay, ReplayError, ReplayOutcome, ReplayStatus};
