//! Replay context handed to workflow code
//!
//! A [`WorkflowContext`] is built from an instance's full history. Every
//! primitive either answers from history or records the command it needs:
//!
//! - commands (`schedule_activity`, `start_timer`, `cancel_timer`) are
//!   matched, in order, against the command events already in history; the
//!   first one past the end of that list is new
//! - waits (`await_activity`, `await_timer`, `receive`, `select`) resolve to
//!   the earliest matching resolution event in history, or suspend
//!
//! Because history only grows, a resolution that was visible to one run is
//! visible, at the same position, to every later run. Picking the earliest
//! position is therefore the same choice a run made the first time it got
//! past a wait, which is what makes `select` deterministic.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::definition::{error_codes, WorkflowError, WorkflowInterrupt, WorkflowResult};
use super::{ActivityOptions, HistoryEvent, WorkflowCommand, WorkflowEvent, WorkflowSignal};
use crate::activity::{Activity, ActivityError};

/// Replay derived something that history contradicts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("determinism violation at event {sequence}: history recorded {recorded}, replay derived {derived}")]
pub struct DeterminismViolation {
    /// Sequence of the recorded event that did not match
    pub sequence: u64,

    /// What history holds at that point
    pub recorded: String,

    /// What the workflow did instead
    pub derived: String,
}

/// Handle to a scheduled activity call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityHandle {
    id: String,
}

impl ActivityHandle {
    /// Deterministic activity ID (`activity-<n>`)
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to a durable timer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: String,
}

impl TimerHandle {
    /// Deterministic timer ID (`timer-<n>`)
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// How a timer wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The deadline passed
    Fired,

    /// The workflow canceled the timer before it fired
    Canceled,
}

/// Something a workflow can wait on inside [`WorkflowContext::select`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaitable {
    /// Completion or permanent failure of an activity call
    Activity(ActivityHandle),

    /// Firing of a timer
    Timer(TimerHandle),

    /// Next signal on a channel
    Signal(String),
}

impl Awaitable {
    /// Wait for the next signal on `channel`
    pub fn signal(channel: impl Into<String>) -> Self {
        Self::Signal(channel.into())
    }
}

impl From<&ActivityHandle> for Awaitable {
    fn from(handle: &ActivityHandle) -> Self {
        Self::Activity(handle.clone())
    }
}

impl From<&TimerHandle> for Awaitable {
    fn from(handle: &TimerHandle) -> Self {
        Self::Timer(handle.clone())
    }
}

/// Value of the branch that won a select
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Activity outcome
    Activity(Result<Value, ActivityError>),

    /// Timer fired
    TimerFired,

    /// Signal consumed from the channel
    Signal(WorkflowSignal),
}

/// Result of a select: which awaitable won, and its value
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    /// Index into the awaitables passed to `select`
    pub index: usize,

    /// The resolved value
    pub resolution: Resolution,
}

/// Deterministic execution context for one replay of one instance
pub struct WorkflowContext {
    workflow_id: Uuid,
    history: Vec<HistoryEvent>,

    // Positions (indexes into `history`) of recorded command events.
    recorded_commands: Vec<usize>,
    command_cursor: usize,
    new_commands: Vec<WorkflowCommand>,

    next_activity: u32,
    next_timer: u32,

    activity_outcomes: HashMap<String, usize>,
    timers_fired: HashMap<String, usize>,
    timers_canceled: HashSet<String>,
    signals: HashMap<String, Vec<usize>>,
    signals_consumed: HashMap<String, usize>,

    logical_now: DateTime<Utc>,
    suspended: bool,
    violation: Option<DeterminismViolation>,
}

impl WorkflowContext {
    /// Build a context over a full history
    ///
    /// `history` must start with `WorkflowStarted`; the replay engine checks
    /// that before calling.
    pub(crate) fn new(workflow_id: Uuid, history: Vec<HistoryEvent>) -> Self {
        let mut recorded_commands = Vec::new();
        let mut activity_outcomes = HashMap::new();
        let mut timers_fired = HashMap::new();
        let mut signals: HashMap<String, Vec<usize>> = HashMap::new();

        for (position, entry) in history.iter().enumerate() {
            match &entry.event {
                event if event.is_command() => recorded_commands.push(position),
                WorkflowEvent::ActivityCompleted { activity_id, .. }
                | WorkflowEvent::ActivityFailed { activity_id, .. } => {
                    activity_outcomes.entry(activity_id.clone()).or_insert(position);
                }
                WorkflowEvent::TimerFired { timer_id } => {
                    timers_fired.entry(timer_id.clone()).or_insert(position);
                }
                WorkflowEvent::SignalReceived { signal } => {
                    signals.entry(signal.channel.clone()).or_default().push(position);
                }
                _ => {}
            }
        }

        let logical_now = history
            .first()
            .map(|entry| entry.recorded_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            workflow_id,
            history,
            recorded_commands,
            command_cursor: 0,
            new_commands: Vec::new(),
            next_activity: 0,
            next_timer: 0,
            activity_outcomes,
            timers_fired,
            timers_canceled: HashSet::new(),
            signals,
            signals_consumed: HashMap::new(),
            logical_now,
            suspended: false,
            violation: None,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Instance being executed
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Deterministic current time
    ///
    /// Starts at the instance creation time and advances to the
    /// `recorded_at` of each resolution the workflow consumes.
    pub fn now(&self) -> DateTime<Utc> {
        self.logical_now
    }

    /// Whether the code currently running re-derives already recorded commands
    ///
    /// Useful to keep logs from repeating on every resume.
    pub fn is_replaying(&self) -> bool {
        self.command_cursor < self.recorded_commands.len()
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Schedule an activity call without waiting for it
    pub fn schedule_activity(
        &mut self,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
    ) -> WorkflowResult<ActivityHandle> {
        self.next_activity += 1;
        let id = format!("activity-{}", self.next_activity);
        self.record(WorkflowCommand::ScheduleActivity {
            activity_id: id.clone(),
            activity_type: activity_type.to_string(),
            input,
            options,
        })?;
        Ok(ActivityHandle { id })
    }

    /// Wait for an activity call to resolve
    ///
    /// The inner result is the activity's output, or its permanent failure
    /// once retries are exhausted.
    pub fn await_activity(
        &mut self,
        handle: &ActivityHandle,
    ) -> WorkflowResult<Result<Value, ActivityError>> {
        self.ensure_consistent()?;
        match self.activity_outcomes.get(&handle.id).copied() {
            Some(position) => {
                self.observe(position);
                Ok(self.activity_outcome(position))
            }
            None => self.suspend(),
        }
    }

    /// Schedule a typed activity and wait for its result
    ///
    /// ```ignore
    /// let count = ctx.execute_activity::<ProcessImages>(&gallery_id, options)??;
    /// ```
    ///
    /// The outer `?` propagates suspension; the inner one turns a permanent
    /// activity failure into a workflow failure.
    pub fn execute_activity<A: Activity>(
        &mut self,
        input: &A::Input,
        options: ActivityOptions,
    ) -> WorkflowResult<Result<A::Output, ActivityError>> {
        let input = serde_json::to_value(input).map_err(|e| {
            WorkflowError::new(format!("cannot encode input for {}: {e}", A::TYPE))
                .with_code(error_codes::INVALID_INPUT)
        })?;
        let handle = self.schedule_activity(A::TYPE, input, options)?;
        let outcome = self.await_activity(&handle)?;
        Ok(outcome.and_then(|value| serde_json::from_value(value).map_err(ActivityError::from)))
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Start a durable timer
    pub fn start_timer(&mut self, duration: Duration) -> WorkflowResult<TimerHandle> {
        self.next_timer += 1;
        let id = format!("timer-{}", self.next_timer);
        self.record(WorkflowCommand::StartTimer {
            timer_id: id.clone(),
            duration,
        })?;
        Ok(TimerHandle { id })
    }

    /// Cancel a timer
    ///
    /// A no-op when history already holds `TimerFired` for it: the race was
    /// resolved in the timer's favor.
    pub fn cancel_timer(&mut self, handle: &TimerHandle) -> WorkflowResult<()> {
        self.ensure_consistent()?;
        if self.timers_fired.contains_key(&handle.id) || self.timers_canceled.contains(&handle.id)
        {
            return Ok(());
        }
        self.timers_canceled.insert(handle.id.clone());
        self.record(WorkflowCommand::CancelTimer {
            timer_id: handle.id.clone(),
        })
    }

    /// Wait for a timer to fire or to be canceled by this workflow
    pub fn await_timer(&mut self, handle: &TimerHandle) -> WorkflowResult<TimerOutcome> {
        self.ensure_consistent()?;
        if self.timers_canceled.contains(&handle.id) {
            return Ok(TimerOutcome::Canceled);
        }
        match self.timers_fired.get(&handle.id).copied() {
            Some(position) => {
                self.observe(position);
                Ok(TimerOutcome::Fired)
            }
            None => self.suspend(),
        }
    }

    /// Durable sleep
    pub fn sleep(&mut self, duration: Duration) -> WorkflowResult<()> {
        let timer = self.start_timer(duration)?;
        self.await_timer(&timer)?;
        Ok(())
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Wait for the next signal on `channel`
    ///
    /// Signals delivered before the wait are buffered and returned in
    /// arrival order, each exactly once.
    pub fn receive(&mut self, channel: &str) -> WorkflowResult<WorkflowSignal> {
        let selected = self.select(&[Awaitable::signal(channel)])?;
        match selected.resolution {
            Resolution::Signal(signal) => Ok(signal),
            other => Err(WorkflowInterrupt::Failed(WorkflowError::new(format!(
                "receive on {channel} resolved to {other:?}"
            )))),
        }
    }

    // =========================================================================
    // Select
    // =========================================================================

    /// Wait for the first of several awaitables
    ///
    /// Exactly one branch resolves. When several already have a result, the
    /// one whose event was appended to history first wins. The losing
    /// branches are untouched: signals stay buffered, and a losing timer
    /// keeps running until the workflow cancels it.
    pub fn select(&mut self, awaitables: &[Awaitable]) -> WorkflowResult<Selected> {
        self.ensure_consistent()?;

        let winner = awaitables
            .iter()
            .enumerate()
            .filter_map(|(index, awaitable)| {
                self.resolution_position(awaitable).map(|position| (position, index))
            })
            .min();

        let Some((position, index)) = winner else {
            return self.suspend();
        };

        self.observe(position);
        let resolution = match &awaitables[index] {
            Awaitable::Activity(_) => Resolution::Activity(self.activity_outcome(position)),
            Awaitable::Timer(_) => Resolution::TimerFired,
            Awaitable::Signal(channel) => {
                *self.signals_consumed.entry(channel.clone()).or_insert(0) += 1;
                match &self.history[position].event {
                    WorkflowEvent::SignalReceived { signal } => Resolution::Signal(signal.clone()),
                    other => {
                        return Err(WorkflowInterrupt::Failed(WorkflowError::new(format!(
                            "signal index points at {}",
                            other.event_type()
                        ))))
                    }
                }
            }
        };

        Ok(Selected { index, resolution })
    }

    // =========================================================================
    // Engine side
    // =========================================================================

    /// Whether the run stopped because it needs more history
    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Check that every recorded command was re-derived
    ///
    /// Called once the run has returned or suspended; `derived` names what the
    /// workflow did instead of issuing the next recorded command.
    pub(crate) fn verify_exhausted(&mut self, derived: &str) {
        if self.violation.is_some() {
            return;
        }
        if let Some(&position) = self.recorded_commands.get(self.command_cursor) {
            let entry = &self.history[position];
            self.violation = Some(DeterminismViolation {
                sequence: entry.sequence,
                recorded: describe_event(&entry.event),
                derived: derived.to_string(),
            });
        }
    }

    /// First determinism violation seen during the run
    pub(crate) fn violation(&self) -> Option<&DeterminismViolation> {
        self.violation.as_ref()
    }

    /// Commands derived past the end of history
    pub(crate) fn take_new_commands(&mut self) -> Vec<WorkflowCommand> {
        std::mem::take(&mut self.new_commands)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record(&mut self, command: WorkflowCommand) -> WorkflowResult<()> {
        self.ensure_consistent()?;

        let Some(&position) = self.recorded_commands.get(self.command_cursor) else {
            self.new_commands.push(command);
            return Ok(());
        };

        let entry = &self.history[position];
        if command.matches_event(&entry.event) {
            self.command_cursor += 1;
            return Ok(());
        }

        let violation = DeterminismViolation {
            sequence: entry.sequence,
            recorded: describe_event(&entry.event),
            derived: describe_command(&command),
        };
        self.violation = Some(violation.clone());
        Err(WorkflowInterrupt::Nondeterministic(violation))
    }

    fn ensure_consistent(&self) -> WorkflowResult<()> {
        match &self.violation {
            Some(violation) => Err(WorkflowInterrupt::Nondeterministic(violation.clone())),
            None => Ok(()),
        }
    }

    fn suspend<T>(&mut self) -> WorkflowResult<T> {
        self.suspended = true;
        Err(WorkflowInterrupt::Suspended)
    }

    fn observe(&mut self, position: usize) {
        let recorded_at = self.history[position].recorded_at;
        if recorded_at > self.logical_now {
            self.logical_now = recorded_at;
        }
    }

    fn resolution_position(&self, awaitable: &Awaitable) -> Option<usize> {
        match awaitable {
            Awaitable::Activity(handle) => self.activity_outcomes.get(&handle.id).copied(),
            Awaitable::Timer(handle) if self.timers_canceled.contains(&handle.id) => None,
            Awaitable::Timer(handle) => self.timers_fired.get(&handle.id).copied(),
            Awaitable::Signal(channel) => {
                let consumed = self.signals_consumed.get(channel).copied().unwrap_or(0);
                self.signals
                    .get(channel)
                    .and_then(|positions| positions.get(consumed))
                    .copied()
            }
        }
    }

    fn activity_outcome(&self, position: usize) -> Result<Value, ActivityError> {
        match &self.history[position].event {
            WorkflowEvent::ActivityCompleted { result, .. } => Ok(result.clone()),
            WorkflowEvent::ActivityFailed { error, .. } => Err(error.clone()),
            other => Err(ActivityError::non_retryable(format!(
                "expected activity outcome, found {}",
                other.event_type()
            ))),
        }
    }
}

fn describe_event(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::ActivityScheduled {
            activity_id,
            activity_type,
            ..
        } => format!("activity_scheduled({activity_id}, {activity_type})"),
        WorkflowEvent::TimerScheduled {
            timer_id,
            duration_ms,
            ..
        } => format!("timer_scheduled({timer_id}, {duration_ms}ms)"),
        WorkflowEvent::TimerCanceled { timer_id } => format!("timer_canceled({timer_id})"),
        other => other.event_type().to_string(),
    }
}

fn describe_command(command: &WorkflowCommand) -> String {
    match command {
        WorkflowCommand::ScheduleActivity {
            activity_id,
            activity_type,
            ..
        } => format!("schedule_activity({activity_id}, {activity_type})"),
        WorkflowCommand::StartTimer { timer_id, duration } => {
            format!("start_timer({timer_id}, {}ms)", duration.as_millis())
        }
        WorkflowCommand::CancelTimer { timer_id } => format!("cancel_timer({timer_id})"),
        other => other.name().to_string(),
    }
}
