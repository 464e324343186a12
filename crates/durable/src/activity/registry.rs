//! Activity registry for type-erased activity execution
//!
//! Workers only see activity names and JSON payloads. The registry maps each
//! name to a handler that decodes the input, calls the typed [`Activity`] and
//! encodes its output.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Error type reported when a task names an activity nobody registered
pub const UNKNOWN_ACTIVITY_ERROR_TYPE: &str = "UNKNOWN_ACTIVITY";

/// Type-erased activity handler
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>>
        + Send
        + Sync,
>;

/// Registry of activity implementations, keyed by [`Activity::TYPE`]
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity instance
    ///
    /// The instance carries its injected collaborators; it is shared by all
    /// concurrent executions.
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx: ActivityContext, input: Value| {
            execute_typed(Arc::clone(&activity), ctx, input).boxed()
        });
        self.handlers.insert(A::TYPE.to_string(), handler);
        self
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// All registered activity type names
    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }

    /// Execute the named activity with a JSON input
    ///
    /// An unknown name is a permanent failure for that call.
    pub async fn execute(
        &self,
        activity_type: &str,
        ctx: ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let handler = self.handlers.get(activity_type).ok_or_else(|| {
            ActivityError::non_retryable(format!("no activity registered as {activity_type}"))
                .with_type(UNKNOWN_ACTIVITY_ERROR_TYPE)
        })?;
        handler(ctx, input).await
    }
}

async fn execute_typed<A: Activity>(
    activity: Arc<A>,
    ctx: ActivityContext,
    input: Value,
) -> Result<Value, ActivityError> {
    let typed_input: A::Input = serde_json::from_value(input)?;
    let output = activity.execute(&ctx, typed_input).await?;
    Ok(serde_json::to_value(output)?)
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
