//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Fetches and executes activity work items with retries and timeouts
//! - Acks the item together with its completion or failure

use crate::providers::WorkItem;
use crate::runtime::{panic_message, ActivityContext, ActivityHandler};
use crate::ErrorDetails;
use ::futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::super::Runtime;

enum AttemptOutcome {
    Success(String),
    AppError(String),
    TimedOut(Duration),
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.worker_concurrency.max(1);
        (0..concurrency)
            .map(|worker_idx| {
                let rt = self.clone();
                // Unique worker ID: work-{index}-{runtime_id}
                let worker_id = format!("work-{}-{}", worker_idx, rt.runtime_id);
                tokio::spawn(async move {
                    rt.run_worker_loop(worker_id).await;
                })
            })
            .collect()
    }

    /// Lock long enough to cover every attempt plus backoff.
    fn worker_lock_duration(&self) -> Duration {
        self.options
            .worker_lock_timeout
            .saturating_add(self.options.activity_retry.worst_case_duration())
    }

    async fn run_worker_loop(self: Arc<Self>, worker_id: String) {
        loop {
            if self.is_shutting_down() {
                break;
            }
            let fetched = match self.history_store.fetch_work_item(self.worker_lock_duration()).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(target: "duratask::runtime", worker_id = %worker_id, error = %e, "fetch_work_item failed");
                    tokio::time::sleep(self.idle_sleep()).await;
                    continue;
                }
            };
            let Some((item, token)) = fetched else {
                tokio::time::sleep(self.idle_sleep()).await;
                continue;
            };

            let kind = item.kind_name();
            let WorkItem::ActivityExecute { instance, id, name, input } = item else {
                error!(target: "duratask::runtime", worker_id = %worker_id, kind, "Unexpected WorkItem in worker queue");
                let _ = self
                    .history_store
                    .abandon_work_item(&token, Some(Duration::from_secs(1)))
                    .await;
                continue;
            };

            let completion = self.execute_activity(&worker_id, instance, id, name, input).await;
            let acked = self
                .execute_with_retry(
                    || self.history_store.ack_work_item(&token, completion.clone()),
                    "ack_work_item",
                )
                .await;
            if !acked {
                // The lock expires anyway; releasing it early lets another worker redo the activity.
                let _ = self.history_store.abandon_work_item(&token, None).await;
            }
        }
    }

    /// Run all attempts of one activity and return the completion message.
    pub(crate) async fn execute_activity(
        &self,
        worker_id: &str,
        instance: String,
        id: u64,
        name: String,
        input: String,
    ) -> WorkItem {
        let Some(handler) = self.activity_registry.get(&name) else {
            error!(
                target: "duratask::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                outcome = "system_error",
                error_type = "unregistered",
                "Activity failed (unregistered)"
            );
            return WorkItem::ActivityFailed {
                instance,
                id,
                details: ErrorDetails::Configuration {
                    message: format!("unregistered activity: {name}"),
                },
            };
        };

        let policy = &self.options.activity_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            tracing::debug!(
                target: "duratask::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                attempt,
                "Activity started"
            );
            let start_time = Instant::now();
            let ctx = ActivityContext::new(instance.clone(), id, name.clone(), attempt);
            let outcome = run_attempt(handler.clone(), ctx, input.clone(), policy.timeout).await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let (message, timeout) = match outcome {
                AttemptOutcome::Success(result) => {
                    tracing::debug!(
                        target: "duratask::runtime",
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        worker_id = %worker_id,
                        outcome = "success",
                        duration_ms,
                        attempt,
                        result_size = result.len(),
                        "Activity completed"
                    );
                    return WorkItem::ActivityCompleted { instance, id, result };
                }
                AttemptOutcome::AppError(message) => (message, None),
                AttemptOutcome::TimedOut(limit) => (format!("attempt timed out after {}ms", limit.as_millis()), Some(limit)),
            };

            if attempt >= max_attempts {
                warn!(
                    target: "duratask::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "app_error",
                    duration_ms,
                    attempts = attempt,
                    error = %message,
                    "Activity failed; retries exhausted"
                );
                let details = match timeout {
                    Some(limit) => ErrorDetails::ActivityTimeout {
                        activity: name,
                        timeout_ms: limit.as_millis() as u64,
                        attempts: attempt,
                    },
                    None => ErrorDetails::ActivityFailure {
                        activity: name,
                        message,
                        attempts: attempt,
                    },
                };
                return WorkItem::ActivityFailed { instance, id, details };
            }

            let delay = policy.backoff.delay_for_attempt(attempt);
            warn!(
                target: "duratask::runtime",
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                worker_id = %worker_id,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %message,
                "Activity attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

async fn run_attempt(
    handler: Arc<dyn ActivityHandler>,
    ctx: ActivityContext,
    input: String,
    timeout: Option<Duration>,
) -> AttemptOutcome {
    let fut = AssertUnwindSafe(async move { handler.invoke(ctx, input).await }).catch_unwind();
    let finished = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(finished) => finished,
            Err(_) => return AttemptOutcome::TimedOut(limit),
        },
        None => fut.await,
    };
    match finished {
        Ok(Ok(result)) => AttemptOutcome::Success(result),
        Ok(Err(message)) => AttemptOutcome::AppError(message),
        Err(payload) => AttemptOutcome::AppError(format!("activity panicked: {}", panic_message(payload.as_ref()))),
    }
}
