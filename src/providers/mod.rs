//! History stores and the work queues that drive the runtime.
//!
//! A provider is the single source of mutable shared state. It keeps the
//! append-only history per instance plus three peek-lock queues:
//!
//! - orchestrator queue: start requests, activity/timer completions, terminate requests
//! - worker queue: activities waiting to execute
//! - timer queue: timers, visible once their fire time passes
//!
//! Acknowledging an orchestration item commits the history delta and the
//! outgoing work items in one step, so a crash never leaves an activity
//! recorded as scheduled without a matching queue message (or the reverse).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::{ErrorDetails, Event};

mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// Messages exchanged between the client, the orchestration dispatcher, the
/// worker dispatcher and the timer dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        details: ErrorDetails,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Earliest visibility for a timer-queue message, if it carries one.
    pub(crate) fn fire_at_ms(&self) -> Option<u64> {
        match self {
            WorkItem::TimerSchedule { fire_at_ms, .. } | WorkItem::TimerFired { fire_at_ms, .. } => Some(*fire_at_ms),
            _ => None,
        }
    }

    /// Instance the message belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
        }
    }

    /// Convert a completion message to its history event.
    pub fn to_completion_event(&self) -> Option<Event> {
        match self {
            WorkItem::ActivityCompleted { id, result, .. } => Some(Event::ActivityCompleted {
                id: *id,
                result: result.clone(),
            }),
            WorkItem::ActivityFailed { id, details, .. } => Some(Event::ActivityFailed {
                id: *id,
                details: details.clone(),
            }),
            WorkItem::TimerFired { id, fire_at_ms, .. } => Some(Event::TimerFired {
                id: *id,
                fire_at_ms: *fire_at_ms,
            }),
            _ => None,
        }
    }
}

/// A locked batch of orchestrator messages for one instance plus its history.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Durable history store with peek-lock work queues.
///
/// Implementations must serialize appends per instance and must never hand
/// out an orchestration item for an instance that is already locked.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Create the instance, persist `OrchestrationStarted` and enqueue
    /// `StartOrchestration`. Fails with a permanent error if the instance exists.
    async fn create_instance(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ProviderError>;

    /// Full ordered history. `InstanceNotFound` for unknown instances.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Atomic ordered append. Completion events whose id already has a
    /// terminal event are dropped. `InstanceNotFound` for unknown instances.
    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next instance with visible messages for `lock_for`.
    async fn fetch_orchestration_item(&self, lock_for: Duration) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Append `history_delta`, delete the locked messages, enqueue the
    /// outgoing items and release the instance lock, atomically.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the lock; messages become visible again after `delay`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Enqueue an `ActivityExecute` directly, outside an orchestration ack.
    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the locked activity and enqueue its completion, atomically.
    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    /// Enqueue a `TimerSchedule`; it stays invisible until `fire_at_ms`.
    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Next timer whose fire time has passed.
    async fn fetch_timer_item(&self, lock_for: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the locked timer and enqueue `fired`, atomically.
    async fn ack_timer_item(&self, token: &str, fired: WorkItem) -> Result<(), ProviderError>;

    /// Release a timer lock; the timer fires again after `delay`.
    async fn abandon_timer_item(&self, token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;
}

/// Drop completion events whose correlation id already has a terminal event,
/// either in `existing` or earlier in `new_events`.
pub(crate) fn dedupe_completions(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<u64> = existing
        .iter()
        .filter(|e| e.is_completion())
        .filter_map(Event::correlation_id)
        .collect();
    let mut terminal = existing.iter().any(Event::is_orchestration_terminal);
    let mut out = Vec::with_capacity(new_events.len());
    for event in new_events {
        if event.is_completion() {
            match event.correlation_id() {
                Some(id) if !seen.insert(id) => continue,
                _ => {}
            }
        }
        if event.is_orchestration_terminal() {
            if terminal {
                continue;
            }
            terminal = true;
        }
        out.push(event);
    }
    out
}
