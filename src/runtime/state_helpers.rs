use crate::{Event, ErrorDetails};

use super::OrchestrationStatus;

/// Reader for extracting metadata from orchestration history
///
/// Scans the event history once so callers don't have to repeatedly match on
/// events to find the orchestration name, its input or its terminal state.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    /// Orchestration name (from OrchestrationStarted)
    pub orchestration_name: Option<String>,

    /// Original input (from OrchestrationStarted)
    pub orchestration_input: Option<String>,

    /// Output of `OrchestrationCompleted`, if present
    pub output: Option<String>,

    pub failure: Option<ErrorDetails>,

    pub terminate_reason: Option<String>,

    /// Correlation ids scheduled but not yet completed
    pub outstanding: Vec<u64>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut manager = Self::default();
        let mut scheduled = Vec::new();
        let mut done = std::collections::HashSet::new();
        for event in history {
            match event {
                Event::OrchestrationStarted { name, input, .. } => {
                    manager.orchestration_name = Some(name.clone());
                    manager.orchestration_input = Some(input.clone());
                }
                Event::ActivityScheduled { id, .. } | Event::TimerCreated { id, .. } => scheduled.push(*id),
                Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } | Event::TimerFired { id, .. } => {
                    done.insert(*id);
                }
                // First terminal event wins; providers never append a second one.
                Event::OrchestrationCompleted { output } if !manager.is_terminal() => {
                    manager.output = Some(output.clone());
                }
                Event::OrchestrationFailed { details } if !manager.is_terminal() => {
                    manager.failure = Some(details.clone());
                }
                Event::OrchestrationTerminated { reason } if !manager.is_terminal() => {
                    manager.terminate_reason = Some(reason.clone());
                }
                _ => {}
            }
        }
        manager.outstanding = scheduled.into_iter().filter(|id| !done.contains(id)).collect();
        manager
    }

    pub fn is_terminal(&self) -> bool {
        self.output.is_some() || self.failure.is_some() || self.terminate_reason.is_some()
    }

    /// Status as seen by clients. Empty history means the instance does not exist.
    pub fn status(&self) -> OrchestrationStatus {
        if let Some(output) = &self.output {
            OrchestrationStatus::Completed { output: output.clone() }
        } else if let Some(details) = &self.failure {
            OrchestrationStatus::Failed {
                details: details.clone(),
            }
        } else if let Some(reason) = &self.terminate_reason {
            OrchestrationStatus::Terminated { reason: reason.clone() }
        } else if self.orchestration_name.is_some() {
            OrchestrationStatus::Running
        } else {
            OrchestrationStatus::NotFound
        }
    }
}
