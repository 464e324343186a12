//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for deterministic orchestration code
//! - [`WorkflowContext`] for replay-aware activities, timers, signals and select
//! - [`WorkflowCommand`] enum for commands derived by replay
//! - [`WorkflowEvent`] enum for persisted history
//! - [`WorkflowSignal`] for external communication

mod command;
mod context;
mod definition;
mod event;
mod signal;

pub use command::{ActivityOptions, WorkflowCommand};
pub use context::{
    ActivityHandle, Awaitable, DeterminismViolation, Resolution, Selected, TimerHandle,
    TimerOutcome, WorkflowContext,
};
pub use definition::{
    error_codes, Workflow, WorkflowError, WorkflowInterrupt, WorkflowResult,
};
pub use event::{terminal_event, HistoryEvent, WorkflowEvent};
pub use signal::WorkflowSignal;
