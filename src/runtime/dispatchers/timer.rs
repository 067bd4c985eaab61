//! Timer dispatcher: turns due `TimerSchedule` items into `TimerFired`
//! messages for the orchestrator queue.

use crate::providers::WorkItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;

impl Runtime {
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    break;
                }
                // Providers only hand out timers whose fire time has passed.
                let fetched = match self
                    .history_store
                    .fetch_timer_item(self.options.orchestrator_lock_timeout)
                    .await
                {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        warn!(target: "duratask::runtime", error = %e, "fetch_timer_item failed");
                        None
                    }
                };
                let Some((item, token)) = fetched else {
                    tokio::time::sleep(self.idle_sleep()).await;
                    continue;
                };
                match item {
                    WorkItem::TimerSchedule { instance, id, fire_at_ms } => {
                        debug!(target: "duratask::runtime", instance_id = %instance, timer_id = id, fire_at_ms, "Timer fired");
                        let fired = WorkItem::TimerFired { instance, id, fire_at_ms };
                        let acked = self
                            .execute_with_retry(
                                || self.history_store.ack_timer_item(&token, fired.clone()),
                                "ack_timer_item",
                            )
                            .await;
                        if !acked {
                            error!(target: "duratask::runtime", instance_id = %fired.instance(), timer_id = id, "Timer ack failed; releasing timer");
                            if let Err(e) = self
                                .history_store
                                .abandon_timer_item(&token, Some(self.idle_sleep()))
                                .await
                            {
                                error!(target: "duratask::runtime", error = %e, "abandon_timer_item failed");
                            }
                        }
                    }
                    other => {
                        error!(target: "duratask::runtime", kind = other.kind_name(), "Unexpected WorkItem in timer queue");
                        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                    }
                }
            }
        })
    }
}
