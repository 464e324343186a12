//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Configuration for activity retries
///
/// The delay after failed attempt `n` is
/// `first_retry_interval × backoff_coefficient^(n-1)`, capped at
/// `max_interval`, optionally jittered.
///
/// # Example
///
/// ```
/// use photoflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(5), 2.0);
///
/// // Attempt 1 runs immediately, attempt 2 after 5s, attempt 3 after 10s more
/// assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(5));
/// assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub first_retry_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Upper bound for a single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness
    #[serde(default)]
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s first retry interval, 2x backoff
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }
}

/// What the dispatcher should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Run attempt `next_attempt` after `delay`
    Retry { next_attempt: u32, delay: Duration },

    /// The failure is final
    GiveUp,
}

impl RetryPolicy {
    /// Exponential backoff policy without jitter
    pub fn new(max_attempts: u32, first_retry_interval: Duration, backoff_coefficient: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_retry_interval,
            backoff_coefficient: backoff_coefficient.max(1.0),
            max_interval: Duration::from_secs(3600),
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self::new(max_attempts, interval, 1.0)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay between failed attempt `attempt` (1-based) and the next one
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.first_retry_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type may be retried under this policy
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide what happens after `attempt` failed with `error`
    pub fn decide(&self, attempt: u32, error: &ActivityError) -> RetryDecision {
        if error.retryable
            && self.should_retry(error.error_type.as_deref())
            && self.has_attempts_remaining(attempt)
        {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.delay_after_attempt(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
