//! Durable fan-out/fan-in orchestrations driven by deterministic replay.
//!
//! Orchestrations are ordinary async functions that receive an
//! [`OrchestrationContext`]. Every scheduling call they make is recorded as an
//! append-only [`Event`] in a provider-owned history; after each checkpoint the
//! runtime replays the function from the top against that history, so the
//! in-memory state of an instance is always reconstructible after a crash.
//!
//! The crate provides:
//!
//! - The data model: [`Event`], [`Action`], [`ErrorDetails`]
//! - [`OrchestrationContext`] with replay-safe scheduling of activities,
//!   timers and fan-out barriers (see [`futures`])
//! - History stores with work queues ([`providers`])
//! - The runtime that replays orchestrations and executes activities with
//!   retries ([`runtime`]) plus the control-plane [`Client`]
//! - The range-file sample domain ([`range_files`]) writing to a
//!   [`blob_store::BlobStore`]
//!
//! ```rust,no_run
//! use duratask::{ActivityContext, OrchestrationContext};
//! use duratask::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
//!
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register_with_activities("Greeter", ["Greet"], |ctx: OrchestrationContext, input: String| async move {
//!         let names: Vec<(&str, String)> = input.split(',').map(|n| ("Greet", n.to_string())).collect();
//!         let greetings = ctx.fan_out(names).await.map_err(|e| e.to_string())?;
//!         Ok(greetings.join(" "))
//!     })
//!     .build();
//! # let _ = (activities, orchestrations);
//! ```
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod blob_store;
pub mod client;
pub mod config;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod range_files;
pub mod runtime;

pub use client::{Client, ClientError};
pub use crate::futures::{ActivityFuture, FanInPartialFailure, FanOut, FanOutFuture, JoinAll, TimerFuture};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{
    ActivityContext, BackoffStrategy, OrchestrationStatus, RetryPolicy, Runtime, RuntimeOptions, WaitError,
};

/// First correlation id assigned to a scheduled activity or timer within an instance.
pub const INITIAL_CORRELATION_ID: u64 = 1;

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling events carry a correlation `id` that
/// pairs them with their completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was created to run orchestration `name` with `input`.
    OrchestrationStarted { name: String, input: String, timestamp_ms: u64 },
    /// Activity was scheduled; `id` is the call-order sequence number.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity produced a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed terminally (retries exhausted or not retryable).
    ActivityFailed { id: u64, details: ErrorDetails },
    /// Durable timer was created to fire at `fire_at_ms` (epoch millis).
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Durable timer fired.
    TimerFired { id: u64, fire_at_ms: u64 },
    /// Orchestration returned successfully.
    OrchestrationCompleted { output: String },
    /// Orchestration failed; terminal.
    OrchestrationFailed { details: ErrorDetails },
    /// Orchestration was terminated by a client request; terminal.
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// Correlation id for scheduling and completion events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. } => Some(*id),
            Event::OrchestrationStarted { .. }
            | Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. }
            | Event::OrchestrationTerminated { .. } => None,
        }
    }

    /// True for events that resolve a scheduled activity or timer.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. } | Event::ActivityFailed { .. } | Event::TimerFired { .. }
        )
    }

    /// True for events that end the orchestration instance.
    pub fn is_orchestration_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }

    /// Stable name of the variant, used as the `event_type` column and in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::OrchestrationStarted { .. } => "OrchestrationStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            Event::OrchestrationFailed { .. } => "OrchestrationFailed",
            Event::OrchestrationTerminated { .. } => "OrchestrationTerminated",
        }
    }
}

/// Decisions produced by an orchestration turn. The runtime turns these into
/// work items once the matching schedule events are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity { id: u64, name: String, input: String },
    CreateTimer { id: u64, fire_at_ms: u64 },
}

/// Structured failure information recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    /// Replay diverged from the recorded history. Fatal to the instance.
    NonDeterminism { message: String },
    /// Every attempt of an activity exceeded its timeout.
    ActivityTimeout { activity: String, timeout_ms: u64, attempts: u32 },
    /// The activity handler returned an error on its final attempt.
    ActivityFailure { activity: String, message: String, attempts: u32 },
    /// Unregistered orchestration or activity, or other setup problems.
    Configuration { message: String },
    /// The orchestration function returned `Err`.
    Application { message: String },
    /// The orchestration function panicked.
    Panicked { message: String },
}

impl ErrorDetails {
    /// Short category name used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::NonDeterminism { .. } => "nondeterminism",
            ErrorDetails::ActivityTimeout { .. } => "activity_timeout",
            ErrorDetails::ActivityFailure { .. } => "activity_failure",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Panicked { .. } => "panicked",
        }
    }

    /// Human-readable message without the category prefix.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::NonDeterminism { message } => format!("nondeterministic replay: {message}"),
            ErrorDetails::ActivityTimeout {
                activity,
                timeout_ms,
                attempts,
            } => format!("activity '{activity}' timed out after {timeout_ms}ms ({attempts} attempts)"),
            ErrorDetails::ActivityFailure {
                activity,
                message,
                attempts,
            } => format!("activity '{activity}' failed after {attempts} attempts: {message}"),
            ErrorDetails::Configuration { message }
            | ErrorDetails::Application { message }
            | ErrorDetails::Panicked { message } => message.clone(),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category(), self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What a scheduling call asks for; compared positionally against history.
#[derive(Debug, Clone)]
enum ScheduleRequest {
    Activity { name: String, input: String },
    Timer { delay: Duration },
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    /// Indices into `history` of recorded schedule events, in order.
    recorded_schedules: Vec<usize>,
    schedule_cursor: usize,
    next_correlation_id: u64,
    start_time_ms: u64,
    guid_counter: u64,
    new_events: Vec<Event>,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>) -> Self {
        let recorded_schedules: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::ActivityScheduled { .. } | Event::TimerCreated { .. }))
            .map(|(i, _)| i)
            .collect();
        let max_id = history.iter().filter_map(Event::correlation_id).max().unwrap_or(0);
        let start_time_ms = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { timestamp_ms, .. } => Some(*timestamp_ms),
                _ => None,
            })
            .unwrap_or(0);
        Self {
            instance,
            history,
            recorded_schedules,
            schedule_cursor: 0,
            next_correlation_id: max_id.max(INITIAL_CORRELATION_ID - 1) + 1,
            start_time_ms,
            guid_counter: 0,
            new_events: Vec::new(),
            actions: Vec::new(),
            nondeterminism: None,
        }
    }

    fn is_replaying(&self) -> bool {
        self.schedule_cursor < self.recorded_schedules.len()
    }

    /// Recorded schedule events no scheduling call has claimed yet.
    fn unclaimed_schedules(&self) -> Vec<&Event> {
        self.recorded_schedules[self.schedule_cursor.min(self.recorded_schedules.len())..]
            .iter()
            .map(|&idx| &self.history[idx])
            .collect()
    }

    /// Match the next scheduling call against history or record a new one.
    /// Returns the correlation id, or `None` once replay has diverged.
    fn claim(&mut self, request: ScheduleRequest) -> Option<u64> {
        if self.nondeterminism.is_some() {
            return None;
        }
        if let Some(&idx) = self.recorded_schedules.get(self.schedule_cursor) {
            self.schedule_cursor += 1;
            let recorded = &self.history[idx];
            let matched = match (&request, recorded) {
                (ScheduleRequest::Activity { name, input }, Event::ActivityScheduled { id, name: n, input: i })
                    if n == name && i == input =>
                {
                    Some(*id)
                }
                (ScheduleRequest::Timer { .. }, Event::TimerCreated { id, .. }) => Some(*id),
                _ => None,
            };
            if matched.is_none() {
                self.nondeterminism = Some(format!(
                    "schedule #{} requested {:?} but history recorded {:?}",
                    self.schedule_cursor, request, recorded
                ));
            }
            return matched;
        }

        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        let (event, action) = match request {
            ScheduleRequest::Activity { name, input } => (
                Event::ActivityScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                },
                Action::CallActivity { id, name, input },
            ),
            ScheduleRequest::Timer { delay } => {
                let fire_at_ms = now_ms().saturating_add(delay.as_millis() as u64);
                (Event::TimerCreated { id, fire_at_ms }, Action::CreateTimer { id, fire_at_ms })
            }
        };
        self.history.push(event.clone());
        self.new_events.push(event);
        self.actions.push(action);
        Some(id)
    }

    fn activity_outcome(&self, id: u64) -> Option<Result<String, ErrorDetails>> {
        self.history.iter().find_map(|e| match e {
            Event::ActivityCompleted { id: cid, result } if *cid == id => Some(Ok(result.clone())),
            Event::ActivityFailed { id: cid, details } if *cid == id => Some(Err(details.clone())),
            _ => None,
        })
    }

    fn timer_fired(&self, id: u64) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id))
    }
}

/// Handle passed to orchestration functions for replay-safe scheduling.
///
/// Every method either reads history or appends to the turn's pending
/// schedule list. Nothing here touches the wall clock, randomness or I/O on
/// behalf of orchestration logic except through recorded events.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Instance id this context belongs to.
    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// Creation time of the instance as recorded in `OrchestrationStarted`.
    pub fn start_time_ms(&self) -> u64 {
        self.lock().start_time_ms
    }

    /// True while the orchestration is re-executing scheduling calls that are
    /// already recorded in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Deterministic GUID: the same instance and call order always yields the same value.
    pub fn new_guid(&self) -> String {
        let mut inner = self.lock();
        inner.guid_counter += 1;
        let name = format!("{}:{}", inner.instance, inner.guid_counter);
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// Schedule an activity. The call is recorded immediately in call order;
    /// awaiting the returned future suspends until the result is in history.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let name = name.into();
        let input = input.into();
        let id = self.lock().claim(ScheduleRequest::Activity {
            name: name.clone(),
            input,
        });
        ActivityFuture::new(self.clone(), id, name)
    }

    /// Schedule a durable timer that fires after `delay`.
    pub fn schedule_timer(&self, delay: Duration) -> TimerFuture {
        let id = self.lock().claim(ScheduleRequest::Timer { delay });
        TimerFuture::new(self.clone(), id)
    }

    /// Fan out one activity per `(name, input)` item and return the barrier
    /// over all of them. Awaiting the barrier yields results in item order.
    pub fn fan_out<I, N, S>(&self, items: I) -> FanOut
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        let members = items
            .into_iter()
            .map(|(name, input)| self.schedule_activity(name, input))
            .collect();
        FanOut::new(members)
    }

    /// Wait for every future; results are returned in the order given.
    pub fn join(&self, futures: Vec<ActivityFuture>) -> JoinAll {
        JoinAll::new(futures)
    }

    /// Emit an INFO trace unless this call is being replayed.
    pub fn trace_info(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::info!(target: "duratask::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    /// Emit a WARN trace unless this call is being replayed.
    pub fn trace_warn(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::warn!(target: "duratask::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    /// Emit an ERROR trace unless this call is being replayed.
    pub fn trace_error(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::error!(target: "duratask::orchestration", instance_id = %self.instance_id(), "{}", message.into());
        }
    }

    pub(crate) fn activity_outcome(&self, id: u64) -> Option<Result<String, ErrorDetails>> {
        self.lock().activity_outcome(id)
    }

    pub(crate) fn timer_fired(&self, id: u64) -> bool {
        self.lock().timer_fired(id)
    }

    pub(crate) fn nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.clone()
    }

    /// Describes the history schedules this run never reached, if any.
    pub(crate) fn unclaimed_schedules(&self) -> Option<String> {
        let inner = self.lock();
        let unclaimed = inner.unclaimed_schedules();
        let first = unclaimed.first()?;
        Some(format!(
            "history recorded {} schedule(s) the orchestration no longer requests, starting with {:?}",
            unclaimed.len(),
            first
        ))
    }

    /// Drain schedule events and actions produced since construction.
    pub(crate) fn take_turn_output(&self) -> (Vec<Event>, Vec<Action>) {
        let mut inner = self.lock();
        (std::mem::take(&mut inner.new_events), std::mem::take(&mut inner.actions))
    }
}
