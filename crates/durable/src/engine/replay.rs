//! Deterministic replay of workflow code against history
//!
//! Replay is pure: it takes a definition and a history and returns the
//! commands that are new relative to that history. It performs no I/O and
//! reads no clock, so the same history always yields the same commands.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::AnyWorkflow;
use crate::workflow::{
    error_codes, terminal_event, DeterminismViolation, HistoryEvent, WorkflowCommand,
    WorkflowContext, WorkflowError, WorkflowEvent, WorkflowInterrupt,
};

/// Where the workflow stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStatus {
    /// Waiting for a result history does not have yet
    Suspended,

    /// Workflow returned a value
    Completed(Value),

    /// Workflow failed, or replay diverged from history
    Failed(WorkflowError),
}

/// Result of one replay
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// Commands to persist, in derivation order; a terminal command is last
    pub commands: Vec<WorkflowCommand>,

    /// Where the workflow stopped
    pub status: ReplayStatus,

    /// Set when replay diverged from history
    pub violation: Option<DeterminismViolation>,
}

/// History cannot be replayed at all
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// History does not start with `WorkflowStarted`
    #[error("history of {0} does not start with workflow_started")]
    MissingStart(Uuid),

    /// History belongs to another workflow type
    #[error("history of {workflow_id} was started as {recorded}, not {requested}")]
    TypeMismatch {
        workflow_id: Uuid,
        recorded: String,
        requested: String,
    },

    /// History already holds a terminal event
    #[error("workflow {0} has already ended")]
    AlreadyTerminal(Uuid),
}

/// Replay `history` through `workflow` and derive new commands
pub fn replay(
    workflow: &dyn AnyWorkflow,
    workflow_id: Uuid,
    history: Vec<HistoryEvent>,
) -> Result<ReplayOutcome, ReplayError> {
    let input = match history.first().map(|entry| &entry.event) {
        Some(WorkflowEvent::WorkflowStarted {
            workflow_type,
            input,
        }) => {
            if workflow_type != workflow.workflow_type() {
                return Err(ReplayError::TypeMismatch {
                    workflow_id,
                    recorded: workflow_type.clone(),
                    requested: workflow.workflow_type().to_string(),
                });
            }
            input.clone()
        }
        _ => return Err(ReplayError::MissingStart(workflow_id)),
    };

    if terminal_event(&history).is_some() {
        return Err(ReplayError::AlreadyTerminal(workflow_id));
    }

    let history_len = history.len();
    let mut ctx = WorkflowContext::new(workflow_id, history);
    let result = workflow.run(&mut ctx, input);

    let status = match result {
        Ok(_) if ctx.is_suspended() => {
            warn!(%workflow_id, "workflow returned after a suspended wait; treating as suspended");
            ctx.verify_exhausted("suspension");
            ReplayStatus::Suspended
        }
        Ok(output) => {
            ctx.verify_exhausted("workflow completion");
            ReplayStatus::Completed(output)
        }
        Err(WorkflowInterrupt::Suspended) => {
            ctx.verify_exhausted("suspension");
            ReplayStatus::Suspended
        }
        Err(WorkflowInterrupt::Failed(error)) => {
            ctx.verify_exhausted("workflow failure");
            ReplayStatus::Failed(error)
        }
        // The violation is already stored on the context
        Err(WorkflowInterrupt::Nondeterministic(_)) => ReplayStatus::Suspended,
    };

    if let Some(violation) = ctx.violation().cloned() {
        let error = WorkflowError::new(violation.to_string())
            .with_code(error_codes::DETERMINISM_VIOLATION);
        return Ok(ReplayOutcome {
            commands: vec![WorkflowCommand::FailWorkflow {
                error: error.clone(),
            }],
            status: ReplayStatus::Failed(error),
            violation: Some(violation),
        });
    }

    let mut commands = ctx.take_new_commands();
    match &status {
        ReplayStatus::Suspended => {}
        ReplayStatus::Completed(result) => commands.push(WorkflowCommand::CompleteWorkflow {
            result: result.clone(),
        }),
        ReplayStatus::Failed(error) => commands.push(WorkflowCommand::FailWorkflow {
            error: error.clone(),
        }),
    }

    debug!(
        %workflow_id,
        history_len,
        new_commands = commands.len(),
        status = ?status,
        "replayed workflow"
    );

    Ok(ReplayOutcome {
        commands,
        status,
        violation: None,
    })
}
