//! Activity abstractions
//!
//! Activities are side-effecting units of work executed by workers. They:
//! - Run at least once, so implementations must be idempotent
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to keep their task lease alive

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError, TIMEOUT_ERROR_TYPE};
pub use registry::{ActivityHandler, ActivityRegistry, UNKNOWN_ACTIVITY_ERROR_TYPE};
