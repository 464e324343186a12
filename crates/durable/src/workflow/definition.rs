//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{DeterminismViolation, WorkflowContext};
use crate::activity::ActivityError;

/// Well-known workflow error codes
pub mod error_codes {
    /// Replay derived a command that disagrees with history
    pub const DETERMINISM_VIOLATION: &str = "determinism_violation";

    /// An awaited activity failed permanently and the workflow propagated it
    pub const ACTIVITY_FAILED: &str = "activity_failed";

    /// Stored input could not be decoded into the workflow's input type
    pub const INVALID_INPUT: &str = "invalid_input";

    /// Workflow output could not be encoded
    pub const INVALID_OUTPUT: &str = "invalid_output";
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        Self::new(format!("activity failed: {err}")).with_code(error_codes::ACTIVITY_FAILED)
    }
}

/// Why a workflow run stopped before returning a value
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInterrupt {
    /// The workflow needs a result that history does not hold yet
    Suspended,

    /// The workflow failed; the instance ends as `Failed`
    Failed(WorkflowError),

    /// Replay diverged from history; the instance ends as `Failed`
    Nondeterministic(DeterminismViolation),
}

impl From<WorkflowError> for WorkflowInterrupt {
    fn from(err: WorkflowError) -> Self {
        Self::Failed(err)
    }
}

impl From<ActivityError> for WorkflowInterrupt {
    fn from(err: ActivityError) -> Self {
        Self::Failed(err.into())
    }
}

/// Result of workflow code; `?` propagates suspension and failure
pub type WorkflowResult<T> = Result<T, WorkflowInterrupt>;

/// A workflow is deterministic orchestration code re-run against its history
///
/// `run` is executed from the start on every resume. Each engine primitive
/// on [`WorkflowContext`] either returns a result already recorded in
/// history or, when history has no answer yet, records the command it needs
/// and returns [`WorkflowInterrupt::Suspended`], which `?` carries out of
/// `run`.
///
/// # Determinism
///
/// Given the same history, `run` must make the same sequence of context
/// calls with the same arguments. Reading the wall clock, generating random
/// numbers, doing I/O or iterating a `HashMap` inside `run` breaks replay;
/// use [`WorkflowContext::now`] for time and activities for everything that
/// touches the outside world.
///
/// # Example
///
/// ```ignore
/// use photoflow_durable::prelude::*;
///
/// struct OrderWorkflow;
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn run(&self, ctx: &mut WorkflowContext, input: OrderInput) -> WorkflowResult<OrderResult> {
///         let receipt = ctx.execute_activity::<ChargeCard>(&input.payment, ActivityOptions::default())??;
///         ctx.sleep(Duration::from_secs(3600))?;
///         let shipped = ctx.receive("shipped")?;
///         Ok(OrderResult { receipt, tracking: shipped.payload })
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Orchestration logic
    fn run(&self, ctx: &mut WorkflowContext, input: Self::Input) -> WorkflowResult<Self::Output>;
}
