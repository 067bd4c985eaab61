//! Durable futures returned by [`OrchestrationContext`] scheduling calls.
//!
//! These futures never register wakers: they resolve purely from the history
//! snapshot held by the context. The replay engine polls an orchestration once
//! per turn, so a `Pending` here means "checkpoint and wait for more history".
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{ErrorDetails, OrchestrationContext};

/// Future for a single scheduled activity.
pub struct ActivityFuture {
    ctx: OrchestrationContext,
    id: Option<u64>,
    name: String,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, id: Option<u64>, name: String) -> Self {
        Self { ctx, id, name }
    }

    /// Correlation id, or `None` if replay diverged before this call.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn outcome(&self) -> Option<Result<String, ErrorDetails>> {
        self.id.and_then(|id| self.ctx.activity_outcome(id))
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, ErrorDetails>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Future for a durable timer.
pub struct TimerFuture {
    ctx: OrchestrationContext,
    id: Option<u64>,
}

impl TimerFuture {
    pub(crate) fn new(ctx: OrchestrationContext, id: Option<u64>) -> Self {
        Self { ctx, id }
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.id {
            Some(id) if self.ctx.timer_fired(id) => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}

/// Barrier over a set of activity futures. Resolves once every member has a
/// terminal event, with results aligned to the original order.
pub struct JoinAll {
    members: Vec<ActivityFuture>,
}

impl JoinAll {
    pub(crate) fn new(members: Vec<ActivityFuture>) -> Self {
        Self { members }
    }

    fn collect(&self) -> Option<Vec<Result<String, ErrorDetails>>> {
        self.members.iter().map(ActivityFuture::outcome).collect()
    }
}

impl Future for JoinAll {
    type Output = Vec<Result<String, ErrorDetails>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.collect() {
            Some(results) => Poll::Ready(results),
            None => Poll::Pending,
        }
    }
}

/// A fan-out step: N activities scheduled together, awaited as one barrier.
///
/// Awaiting a `FanOut` (or [`FanOut::await_all`]) yields `Ok(outputs)` when
/// every member succeeded, or [`FanInPartialFailure`] carrying every member's
/// outcome when at least one failed terminally.
pub struct FanOut {
    join: JoinAll,
}

impl FanOut {
    pub(crate) fn new(members: Vec<ActivityFuture>) -> Self {
        Self {
            join: JoinAll::new(members),
        }
    }

    /// Correlation ids of the barrier members in item order.
    pub fn ids(&self) -> Vec<Option<u64>> {
        self.join.members.iter().map(ActivityFuture::id).collect()
    }

    pub fn len(&self) -> usize {
        self.join.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join.members.is_empty()
    }

    pub fn await_all(self) -> FanOutFuture {
        FanOutFuture { join: self.join }
    }
}

impl IntoFuture for FanOut {
    type Output = Result<Vec<String>, FanInPartialFailure>;
    type IntoFuture = FanOutFuture;

    fn into_future(self) -> Self::IntoFuture {
        self.await_all()
    }
}

pub struct FanOutFuture {
    join: JoinAll,
}

impl Future for FanOutFuture {
    type Output = Result<Vec<String>, FanInPartialFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(outcomes) = self.join.collect() else {
            return Poll::Pending;
        };
        if outcomes.iter().all(Result::is_ok) {
            Poll::Ready(Ok(outcomes.into_iter().filter_map(Result::ok).collect()))
        } else {
            Poll::Ready(Err(FanInPartialFailure { outcomes }))
        }
    }
}

/// One or more fan-out members failed terminally. Successful outputs stay
/// available at their original index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanInPartialFailure {
    pub outcomes: Vec<Result<String, ErrorDetails>>,
}

impl FanInPartialFailure {
    /// `(index, output)` for every member that succeeded.
    pub fn successes(&self) -> Vec<(usize, &str)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().ok().map(|s| (i, s.as_str())))
            .collect()
    }

    /// `(index, reason)` for every member that failed.
    pub fn failures(&self) -> Vec<(usize, &ErrorDetails)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().err().map(|e| (i, e)))
            .collect()
    }
}

impl fmt::Display for FanInPartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures = self.failures();
        write!(f, "{} of {} fan-out activities failed", failures.len(), self.outcomes.len())?;
        for (idx, err) in failures {
            write!(f, "; [{idx}] {}", err.display_message())?;
        }
        Ok(())
    }
}

impl std::error::Error for FanInPartialFailure {}

impl From<FanInPartialFailure> for String {
    fn from(err: FanInPartialFailure) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;
    use ::futures::task::noop_waker;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn scheduled(n: u64) -> Vec<Event> {
        let mut h = vec![Event::OrchestrationStarted {
            name: "Orch".into(),
            input: String::new(),
            timestamp_ms: 0,
        }];
        for id in 1..=n {
            h.push(Event::ActivityScheduled {
                id,
                name: "Work".into(),
                input: id.to_string(),
            });
        }
        h
    }

    fn fan_out_n(ctx: &OrchestrationContext, n: u64) -> FanOut {
        ctx.fan_out((1..=n).map(|i| ("Work", i.to_string())))
    }

    #[test]
    fn barrier_waits_for_every_member() {
        let mut history = scheduled(3);
        history.push(Event::ActivityCompleted {
            id: 3,
            result: "c".into(),
        });
        history.push(Event::ActivityCompleted {
            id: 1,
            result: "a".into(),
        });
        let ctx = OrchestrationContext::new("i", history);
        let mut fut = fan_out_n(&ctx, 3).await_all();
        assert!(poll_once(&mut fut).is_pending());
    }

    #[test]
    fn barrier_results_follow_item_order_not_completion_order() {
        let mut history = scheduled(3);
        for (id, r) in [(3, "c"), (1, "a"), (2, "b")] {
            history.push(Event::ActivityCompleted { id, result: r.into() });
        }
        let ctx = OrchestrationContext::new("i", history);
        let mut fut = fan_out_n(&ctx, 3).await_all();
        match poll_once(&mut fut) {
            Poll::Ready(Ok(v)) => assert_eq!(v, vec!["a", "b", "c"]),
            _ => panic!("expected resolved barrier"),
        }
    }

    #[test]
    fn empty_fan_out_resolves_immediately() {
        let ctx = OrchestrationContext::new("i", scheduled(0));
        let fan = ctx.fan_out(Vec::<(String, String)>::new());
        assert!(fan.is_empty());
        let mut fut = fan.await_all();
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(v)) if v.is_empty()));
    }

    #[test]
    fn partial_failure_keeps_successful_outputs() {
        let mut history = scheduled(2);
        history.push(Event::ActivityFailed {
            id: 2,
            details: ErrorDetails::ActivityFailure {
                activity: "Work".into(),
                message: "boom".into(),
                attempts: 3,
            },
        });
        history.push(Event::ActivityCompleted {
            id: 1,
            result: "ok".into(),
        });
        let ctx = OrchestrationContext::new("i", history);
        let mut fut = fan_out_n(&ctx, 2).await_all();
        let Poll::Ready(Err(failure)) = poll_once(&mut fut) else {
            panic!("expected partial failure");
        };
        assert_eq!(failure.successes(), vec![(0, "ok")]);
        assert_eq!(failure.failures().len(), 1);
        assert_eq!(failure.failures()[0].0, 1);
        assert!(failure.to_string().contains("1 of 2"));
    }

    #[test]
    fn timer_resolves_on_fired_event() {
        let mut history = scheduled(0);
        history.push(Event::TimerCreated { id: 1, fire_at_ms: 10 });
        history.push(Event::TimerFired { id: 1, fire_at_ms: 10 });
        let ctx = OrchestrationContext::new("i", history);
        let mut timer = ctx.schedule_timer(std::time::Duration::from_millis(10));
        assert!(poll_once(&mut timer).is_ready());
    }
}
