//! In-process runtime: replays orchestrations, executes activities and fires
//! timers, all through a shared [`Provider`].
use crate::providers::Provider;
use crate::{ErrorDetails, OrchestrationContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod dispatchers;
pub mod registry;
pub mod replay_engine;
mod retry;
mod state_helpers;

use async_trait::async_trait;
pub use registry::{ActivityRegistry, OrchestrationRegistry, RegistryError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state_helpers::HistoryManager;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    /// Default: 10ms
    pub dispatcher_idle_sleep_ms: u64,
    /// Number of concurrent orchestration dispatchers. Each instance is still
    /// replayed by at most one of them at a time.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// How long an orchestration turn holds the instance lock.
    pub orchestrator_lock_timeout: Duration,
    /// Minimum activity lock; the effective lock adds the retry budget on top.
    pub worker_lock_timeout: Duration,
    /// Retry policy applied to every activity.
    pub activity_retry: RetryPolicy,
    /// Attempts for provider acks before the item is abandoned.
    pub ack_max_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            orchestrator_lock_timeout: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(30),
            activity_retry: RetryPolicy::default(),
            ack_max_attempts: 5,
        }
    }
}

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for orchestration"),
            WaitError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Per-attempt metadata handed to activity handlers.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance: String,
    activity_id: u64,
    activity_name: String,
    attempt: u32,
}

impl ActivityContext {
    pub(crate) fn new(instance: String, activity_id: u64, activity_name: String, attempt: u32) -> Self {
        Self {
            instance,
            activity_id,
            activity_name,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duratask::activity",
            instance_id = %self.instance,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duratask::activity",
            instance_id = %self.instance,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duratask::activity",
            instance_id = %self.instance,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }
}

/// In-process runtime that executes activities and timers and persists
/// history via a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: ActivityRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime with a custom `Provider` implementation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UndeclaredActivities`] if an orchestration
    /// declared an activity that is not registered.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, RegistryError> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::start_with_store`].
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: ActivityRegistry,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, RegistryError> {
        crate::logging::init_tracing();
        orchestration_registry.validate_activities(&activity_registry)?;

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let mut handles = runtime.clone().start_orchestration_dispatcher();
        handles.extend(runtime.clone().start_work_dispatcher());
        handles.push(runtime.clone().start_timer_dispatcher());
        runtime.joins.lock().await.extend(handles);

        info!(
            target: "duratask::runtime",
            runtime_id = %runtime.runtime_id,
            provider = runtime.history_store.name(),
            orchestrations = runtime.orchestration_registry.count(),
            activities = runtime.activity_registry.count(),
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            "Runtime started"
        );
        Ok(runtime)
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.options.dispatcher_idle_sleep_ms)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Execute a provider call with retry logic and exponential backoff.
    /// Returns `false` once `ack_max_attempts` is exhausted or the error is
    /// not retryable.
    async fn execute_with_retry<F, R>(&self, operation: F, operation_tag: &str) -> bool
    where
        F: Fn() -> R,
        R: std::future::Future<Output = Result<(), crate::providers::ProviderError>>,
    {
        let max_attempts = self.options.ack_max_attempts.max(1);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(()) => {
                    debug!(target: "duratask::runtime", "{} succeeded", operation_tag);
                    return true;
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts.min(16));
                    warn!(target: "duratask::runtime", attempts, backoff_ms, error = %e, "{} failed; retrying", operation_tag);
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    warn!(target: "duratask::runtime", attempts, error = %e, "Failed to {}", operation_tag);
                    return false;
                }
            }
        }
    }

    /// Stop dispatchers. Loops finish their current item and exit; anything
    /// still running after `timeout_ms` (default 1000) is aborted. Returns
    /// once every loop task has finished.
    pub async fn shutdown(self: Arc<Self>, timeout_ms: Option<u64>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms.unwrap_or(1000));
        let handles: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        let mut aborted = 0usize;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(target: "duratask::runtime", runtime_id = %self.runtime_id, aborted, "Dispatcher loops did not stop in time; aborted");
        }
        info!(target: "duratask::runtime", runtime_id = %self.runtime_id, "Runtime stopped");
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
