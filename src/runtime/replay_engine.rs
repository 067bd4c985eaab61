//! One orchestration turn: fold new completions into history, replay the
//! handler from the top and collect what it decided.
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::{panic_message, OrchestrationHandler};
use crate::providers::WorkItem;
use crate::{Action, ErrorDetails, Event, OrchestrationContext};

/// Outcome of a single replay turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Suspended on a durable future; wait for more history.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
}

pub struct ReplayEngine {
    instance: String,
    baseline_history: Vec<Event>,
    /// Completion events derived from this turn's messages.
    completions: Vec<Event>,
    /// Schedule events recorded by the handler during this turn.
    schedules: Vec<Event>,
    pending_actions: Vec<Action>,
    nondeterminism: Option<String>,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, baseline_history: Vec<Event>) -> Self {
        Self {
            instance: instance.into(),
            baseline_history,
            completions: Vec::new(),
            schedules: Vec::new(),
            pending_actions: Vec::new(),
            nondeterminism: None,
        }
    }

    fn already_completed(&self, id: u64) -> bool {
        self.baseline_history
            .iter()
            .chain(self.completions.iter())
            .any(|e| e.is_completion() && e.correlation_id() == Some(id))
    }

    fn has_matching_schedule(&self, completion: &Event) -> bool {
        self.baseline_history.iter().any(|e| match (e, completion) {
            (Event::ActivityScheduled { id, .. }, Event::ActivityCompleted { id: cid, .. })
            | (Event::ActivityScheduled { id, .. }, Event::ActivityFailed { id: cid, .. })
            | (Event::TimerCreated { id, .. }, Event::TimerFired { id: cid, .. }) => id == cid,
            _ => false,
        })
    }

    /// Convert completion messages into events. Duplicates are dropped; a
    /// completion with no matching schedule marks the turn nondeterministic.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        for msg in messages {
            let Some(event) = msg.to_completion_event() else {
                continue;
            };
            let id = event.correlation_id().unwrap_or_default();
            if self.already_completed(id) {
                tracing::debug!(
                    target: "duratask::runtime::replay",
                    instance_id = %self.instance,
                    correlation_id = id,
                    kind = msg.kind_name(),
                    "Dropping duplicate completion"
                );
                continue;
            }
            if !self.has_matching_schedule(&event) {
                if self.nondeterminism.is_none() {
                    self.nondeterminism = Some(format!(
                        "{} for id {id} has no matching schedule in history",
                        msg.kind_name()
                    ));
                }
                continue;
            }
            self.completions.push(event);
        }
    }

    /// Replay `handler` against baseline history plus prepared completions.
    /// The handler is polled exactly once.
    pub fn run_turn(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(message) = self.nondeterminism.clone() {
            return TurnResult::Failed(ErrorDetails::NonDeterminism { message });
        }

        let mut working = self.baseline_history.clone();
        working.extend(self.completions.iter().cloned());
        let ctx = OrchestrationContext::new(self.instance.clone(), working);

        let waker = ::futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| {
            let mut fut = handler.invoke(ctx.clone(), input);
            fut.as_mut().poll(&mut cx)
        }));

        let (events, actions) = ctx.take_turn_output();
        if let Some(message) = ctx.nondeterminism() {
            self.nondeterminism = Some(message.clone());
            return TurnResult::Failed(ErrorDetails::NonDeterminism { message });
        }
        // History only grows, so a deterministic run reaches every schedule it
        // reached before.
        if polled.is_ok() {
            if let Some(message) = ctx.unclaimed_schedules() {
                self.nondeterminism = Some(message.clone());
                return TurnResult::Failed(ErrorDetails::NonDeterminism { message });
            }
        }

        match polled {
            Ok(Poll::Pending) => {
                self.schedules = events;
                self.pending_actions = actions;
                TurnResult::Continue
            }
            Ok(Poll::Ready(Ok(output))) => {
                self.schedules = events;
                self.pending_actions = actions;
                TurnResult::Completed(output)
            }
            Ok(Poll::Ready(Err(message))) => TurnResult::Failed(ErrorDetails::Application { message }),
            Err(payload) => TurnResult::Failed(ErrorDetails::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Events to persist for this turn: completions first, then new schedules.
    pub fn history_delta(&self) -> Vec<Event> {
        self.completions.iter().chain(self.schedules.iter()).cloned().collect()
    }

    pub fn completion_events(&self) -> &[Event] {
        &self.completions
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn nondeterminism(&self) -> Option<&str> {
        self.nondeterminism.as_deref()
    }
}
