//! Workflow commands and activity options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{WorkflowError, WorkflowEvent};
use crate::clock::add_duration;
use crate::reliability::{duration_millis, RetryPolicy};

/// Commands derived by replaying workflow code
///
/// The first three are "recorded" commands: once persisted as events they
/// are matched, in order, against what every later replay derives. The last
/// two close the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowCommand {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Deterministic identifier for this call within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a durable timer
    StartTimer {
        /// Deterministic identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Cancel a timer that has not fired
    CancelTimer {
        /// Timer to cancel
        timer_id: String,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },
}

impl WorkflowCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "schedule_activity",
            Self::StartTimer { .. } => "start_timer",
            Self::CancelTimer { .. } => "cancel_timer",
            Self::CompleteWorkflow { .. } => "complete_workflow",
            Self::FailWorkflow { .. } => "fail_workflow",
        }
    }

    /// Whether this command closes the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. })
    }

    /// Whether a recorded event is the persisted form of this command
    ///
    /// Timer deadlines are not compared: `fire_at` depends on when the
    /// command was first derived, the duration does not.
    pub fn matches_event(&self, event: &WorkflowEvent) -> bool {
        match (self, event) {
            (
                Self::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    ..
                },
                WorkflowEvent::ActivityScheduled {
                    activity_id: recorded_id,
                    activity_type: recorded_type,
                    input: recorded_input,
                    ..
                },
            ) => {
                activity_id == recorded_id
                    && activity_type == recorded_type
                    && input == recorded_input
            }
            (
                Self::StartTimer { timer_id, duration },
                WorkflowEvent::TimerScheduled {
                    timer_id: recorded_id,
                    duration_ms,
                    ..
                },
            ) => timer_id == recorded_id && duration.as_millis() as u64 == *duration_ms,
            (
                Self::CancelTimer { timer_id },
                WorkflowEvent::TimerCanceled {
                    timer_id: recorded_id,
                },
            ) => timer_id == recorded_id,
            _ => false,
        }
    }

    /// Persisted form of this command, derived at `now`
    pub fn into_event(self, now: DateTime<Utc>) -> WorkflowEvent {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
            },
            Self::StartTimer { timer_id, duration } => WorkflowEvent::TimerScheduled {
                timer_id,
                duration_ms: duration.as_millis() as u64,
                fire_at: add_duration(now, duration),
            },
            Self::CancelTimer { timer_id } => WorkflowEvent::TimerCanceled { timer_id },
            Self::CompleteWorkflow { result } => WorkflowEvent::WorkflowCompleted { result },
            Self::FailWorkflow { error } => WorkflowEvent::WorkflowFailed { error },
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for one attempt (from start to completion)
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}
