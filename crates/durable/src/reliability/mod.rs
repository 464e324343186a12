//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{RetryDecision, RetryPolicy};
