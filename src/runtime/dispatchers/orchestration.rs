//! Orchestration dispatcher implementation for Runtime
//!
//! Each loop locks one instance at a time, computes the turn (history delta
//! plus outgoing work items) and commits it with a single ack.

use crate::providers::{OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::HistoryManager;
use crate::{Action, ErrorDetails, Event};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;

/// Everything one turn commits.
#[derive(Debug, Default)]
pub(crate) struct TurnOutput {
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    pub timer_items: Vec<WorkItem>,
}

impl Runtime {
    /// Start `orchestration_concurrency` orchestration loops.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        (0..concurrency)
            .map(|idx| {
                let rt = self.clone();
                let dispatcher_id = format!("orch-{}-{}", idx, rt.runtime_id);
                tokio::spawn(async move {
                    rt.run_orchestration_loop(dispatcher_id).await;
                })
            })
            .collect()
    }

    async fn run_orchestration_loop(self: Arc<Self>, dispatcher_id: String) {
        loop {
            if self.is_shutting_down() {
                break;
            }
            match self
                .history_store
                .fetch_orchestration_item(self.options.orchestrator_lock_timeout)
                .await
            {
                Ok(Some(item)) => self.process_orchestration_item(item, &dispatcher_id).await,
                Ok(None) => tokio::time::sleep(self.idle_sleep()).await,
                Err(e) => {
                    warn!(target: "duratask::runtime", dispatcher_id = %dispatcher_id, error = %e, "fetch_orchestration_item failed");
                    tokio::time::sleep(self.idle_sleep()).await;
                }
            }
        }
    }

    async fn process_orchestration_item(&self, item: OrchestrationItem, dispatcher_id: &str) {
        debug!(
            target: "duratask::runtime",
            instance_id = %item.instance,
            dispatcher_id = %dispatcher_id,
            message_count = item.messages.len(),
            history_len = item.history.len(),
            "Orchestration turn started"
        );
        let turn = self.compute_turn(&item);
        let acked = self
            .execute_with_retry(
                || {
                    self.history_store.ack_orchestration_item(
                        &item.lock_token,
                        turn.history_delta.clone(),
                        turn.worker_items.clone(),
                        turn.timer_items.clone(),
                    )
                },
                "ack_orchestration_item",
            )
            .await;
        if !acked {
            // Never drop messages: release them so a later turn retries.
            if let Err(e) = self
                .history_store
                .abandon_orchestration_item(&item.lock_token, Some(Duration::from_millis(50)))
                .await
            {
                error!(target: "duratask::runtime", instance_id = %item.instance, error = %e, "abandon_orchestration_item failed");
            }
        }
    }

    /// Decide what this turn commits. Pure with respect to the provider.
    pub(crate) fn compute_turn(&self, item: &OrchestrationItem) -> TurnOutput {
        let instance = item.instance.as_str();
        let meta = HistoryManager::from_history(&item.history);
        let mut engine = ReplayEngine::new(instance, item.history.clone());
        engine.prep_completions(&item.messages);

        if meta.is_terminal() {
            // Late completions are recorded but the orchestration is not replayed.
            if !engine.completion_events().is_empty() {
                debug!(
                    target: "duratask::runtime",
                    instance_id = %instance,
                    count = engine.completion_events().len(),
                    "Recording late completions for terminal instance"
                );
            }
            return TurnOutput {
                history_delta: engine.completion_events().to_vec(),
                ..TurnOutput::default()
            };
        }

        let terminate_reason = item.messages.iter().find_map(|m| match m {
            WorkItem::TerminateInstance { reason, .. } => Some(reason.clone()),
            _ => None,
        });
        if let Some(reason) = terminate_reason {
            warn!(
                target: "duratask::runtime",
                instance_id = %instance,
                reason = %reason,
                in_flight = meta.outstanding.len(),
                "Orchestration terminated"
            );
            let mut history_delta = engine.completion_events().to_vec();
            history_delta.push(Event::OrchestrationTerminated { reason });
            return TurnOutput {
                history_delta,
                ..TurnOutput::default()
            };
        }

        let (Some(name), Some(input)) = (meta.orchestration_name.clone(), meta.orchestration_input.clone()) else {
            error!(target: "duratask::runtime", instance_id = %instance, "History has no OrchestrationStarted; dropping messages");
            return TurnOutput::default();
        };

        let Some(handler) = self.orchestration_registry.get(&name) else {
            return self.fail(
                instance,
                &engine,
                ErrorDetails::Configuration {
                    message: format!("unregistered orchestration: {name}"),
                },
            );
        };

        match engine.run_turn(handler, input) {
            TurnResult::Continue => {
                let mut out = TurnOutput {
                    history_delta: engine.history_delta(),
                    ..TurnOutput::default()
                };
                self.route_actions(instance, engine.pending_actions(), &mut out);
                out
            }
            TurnResult::Completed(output) => {
                debug!(target: "duratask::runtime", instance_id = %instance, orchestration_name = %name, "Orchestration completed");
                let mut out = TurnOutput {
                    history_delta: engine.history_delta(),
                    ..TurnOutput::default()
                };
                // Activities scheduled without being awaited still run.
                self.route_actions(instance, engine.pending_actions(), &mut out);
                out.history_delta.push(Event::OrchestrationCompleted { output });
                out
            }
            TurnResult::Failed(details) => self.fail(instance, &engine, details),
        }
    }

    fn fail(&self, instance: &str, engine: &ReplayEngine, details: ErrorDetails) -> TurnOutput {
        error!(
            target: "duratask::runtime",
            instance_id = %instance,
            category = details.category(),
            error = %details.display_message(),
            "Orchestration failed"
        );
        let mut history_delta = engine.completion_events().to_vec();
        history_delta.push(Event::OrchestrationFailed { details });
        TurnOutput {
            history_delta,
            ..TurnOutput::default()
        }
    }

    fn route_actions(&self, instance: &str, actions: &[Action], out: &mut TurnOutput) {
        for action in actions {
            match action {
                Action::CallActivity { id, name, input } => out.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                Action::CreateTimer { id, fire_at_ms } => out.timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                }),
            }
        }
    }
}
