//! Activity trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type reported for an activity attempt that exceeded its timeout
pub const TIMEOUT_ERROR_TYPE: &str = "TIMEOUT";

/// Error type for activity failures
///
/// A retryable error is a transient failure: the dispatcher re-enqueues the
/// task until the retry policy is exhausted. A non-retryable error resolves
/// the activity call as failed immediately. Either way, the final error is
/// what the workflow observes when it awaits the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable (transient) error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Attempt exceeded its start-to-close timeout
    pub fn timeout(after: Duration) -> Self {
        Self::retryable(format!("activity timed out after {}ms", after.as_millis()))
            .with_type(TIMEOUT_ERROR_TYPE)
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "[{}] {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("SERIALIZATION")
    }
}

/// An activity is a side-effecting unit of work invoked by a workflow
///
/// Activities are executed by the worker pool, outside of replay, with
/// **at-least-once** semantics: a worker crash, an expired lease or a
/// retryable failure all lead to the same input being executed again.
/// Implementations must therefore be idempotent, or tolerate duplicate
/// effects. [`ActivityContext::idempotency_key`] is stable across every
/// attempt of one scheduled call and is meant to be forwarded to external
/// systems that deduplicate (mail providers, payment APIs, ...).
///
/// Collaborators (record storage, blob storage, mailers) are fields of the
/// implementing struct and are injected when the activity is registered.
///
/// # Example
///
/// ```ignore
/// use photoflow_durable::prelude::*;
///
/// struct SendEmailActivity {
///     mailer: Arc<dyn Mailer>,
/// }
///
/// #[async_trait]
/// impl Activity for SendEmailActivity {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         let id = self.mailer.send(&ctx.idempotency_key(), input.into()).await?;
///         Ok(SendEmailOutput { message_id: id })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to look up the activity in the registry.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_activity_error_display_with_type() {
        let error = ActivityError::non_retryable("gallery missing").with_type("NOT_FOUND");

        assert!(!error.retryable);
        assert_eq!(error.to_string(), "[NOT_FOUND] gallery missing");
    }

    #[test]
    fn test_timeout_is_retryable() {
        let error = ActivityError::timeout(Duration::from_secs(2));

        assert!(error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(TIMEOUT_ERROR_TYPE));
        assert!(error.message.contains("2000ms"));
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err = anyhow::anyhow!("connection reset").context("uploading blob");
        let error = ActivityError::from(err);

        assert!(error.retryable);
        assert_eq!(error.message, "uploading blob: connection reset");
    }
}
