//! Workflow history events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Events in a workflow instance's history
///
/// The history is append-only and is the sole source of truth for replay.
/// Events fall into four groups:
/// - the seed (`WorkflowStarted`)
/// - recorded commands (`ActivityScheduled`, `TimerScheduled`, `TimerCanceled`)
/// - resolutions (`ActivityCompleted`, `ActivityFailed`, `TimerFired`,
///   `SignalReceived`), which wake the instance up
/// - terminal events, at most one per instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Instance created
    WorkflowStarted {
        /// Registered workflow type
        workflow_type: String,

        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow returned successfully
    WorkflowCompleted {
        /// The workflow output
        result: serde_json::Value,
    },

    /// Workflow failed (returned an error or violated determinism)
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was canceled through the client API
    WorkflowCanceled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity call recorded; the task queue receives its first attempt
    ActivityScheduled {
        /// Deterministic activity identifier (`activity-<n>`)
        activity_id: String,

        /// Type of activity
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity returned a result
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Activity output
        result: serde_json::Value,
    },

    /// Activity failed permanently (non-retryable error or retries exhausted)
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Last error reported
        error: ActivityError,

        /// Number of attempts made
        attempts: u32,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer started
    TimerScheduled {
        /// Deterministic timer identifier (`timer-<n>`)
        timer_id: String,

        /// Requested duration in milliseconds
        duration_ms: u64,

        /// When the timer becomes due
        fire_at: DateTime<Utc>,
    },

    /// Timer reached its deadline
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    /// Timer canceled before it fired
    TimerCanceled {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// External signal delivered to the instance
    SignalReceived {
        /// The signal
        signal: WorkflowSignal,
    },
}

impl WorkflowEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCanceled { .. } => "workflow_canceled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerScheduled { .. } => "timer_scheduled",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCanceled { .. } => "timer_canceled",
            Self::SignalReceived { .. } => "signal_received",
        }
    }

    /// Get the activity ID if this is an activity event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the timer ID if this is a timer event
    pub fn timer_id(&self) -> Option<&str> {
        match self {
            Self::TimerScheduled { timer_id, .. }
            | Self::TimerFired { timer_id }
            | Self::TimerCanceled { timer_id } => Some(timer_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCanceled { .. }
        )
    }

    /// Check if this event records a command derived by replay
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. } | Self::TimerScheduled { .. } | Self::TimerCanceled { .. }
        )
    }

    /// Check if this event can unblock a suspended workflow
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Self::ActivityCompleted { .. }
                | Self::ActivityFailed { .. }
                | Self::TimerFired { .. }
                | Self::SignalReceived { .. }
        )
    }
}

/// An event as stored in history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// 1-based position in the history; equals the instance version after it
    pub sequence: u64,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,

    /// The event
    pub event: WorkflowEvent,
}

/// Terminal event of a history, if the instance has ended
pub fn terminal_event(history: &[HistoryEvent]) -> Option<&WorkflowEvent> {
    history.iter().map(|h| &h.event).find(|e| e.is_terminal())
}
