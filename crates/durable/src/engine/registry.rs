//! Workflow registry for type-erased workflow execution
//!
//! The registry maps workflow type names to definitions that accept and
//! produce JSON, so the executor can replay any instance knowing only the
//! type name stored in its history.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::workflow::{
    error_codes, Workflow, WorkflowContext, WorkflowError, WorkflowInterrupt, WorkflowResult,
};

/// Type-erased workflow interface
///
/// Input and output are JSON; decoding failures fail the instance.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Run the workflow against a replay context
    fn run(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn run(&self, ctx: &mut WorkflowContext, input: Value) -> WorkflowResult<Value> {
        let typed_input: W::Input = serde_json::from_value(input).map_err(|e| {
            WorkflowInterrupt::Failed(
                WorkflowError::new(format!("invalid input for {}: {e}", W::TYPE))
                    .with_code(error_codes::INVALID_INPUT),
            )
        })?;

        let output = self.inner.run(ctx, typed_input)?;

        serde_json::to_value(output).map_err(|e| {
            WorkflowInterrupt::Failed(
                WorkflowError::new(format!("invalid output from {}: {e}", W::TYPE))
                    .with_code(error_codes::INVALID_OUTPUT),
            )
        })
    }
}

/// Registry of workflow definitions
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition
    ///
    /// Definitions are shared by every instance of their type; any
    /// configuration they hold must not change while instances are running,
    /// or replay will diverge.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(GalleryProcessingWorkflow::new(Duration::from_secs(300)));
    /// ```
    pub fn register<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.workflows.insert(
            W::TYPE.to_string(),
            Arc::new(WorkflowWrapper { inner: workflow }),
        );
        self
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Look up a definition by type name
    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        self.workflows
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}
