use std::sync::Arc;
use std::time::Duration;

use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{HistoryManager, OrchestrationStatus, WaitError};
use crate::Event;
use serde::Serialize;

/// Error returned by client operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The instance id is already in use.
    AlreadyExists(String),
    /// Storage failure reported by the provider.
    Provider(ProviderError),
    /// Input could not be encoded.
    Encode(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::AlreadyExists(instance) => write!(f, "instance already exists: {instance}"),
            ClientError::Provider(e) => write!(f, "provider error: {e}"),
            ClientError::Encode(msg) => write!(f, "encode: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Thin client for control-plane operations.
///
/// The client never talks to a runtime directly: it only writes to and reads
/// from the shared provider, so it works from any process that can reach the
/// same store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    /// Create a client bound to a provider instance.
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start an orchestration under a fresh UUID v4 instance id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the store rejects the write.
    pub async fn start_orchestration(&self, orchestration: &str, input: impl Into<String>) -> Result<String, ClientError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration_with_id(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Start an orchestration under a caller-chosen instance id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyExists`] if the id is taken.
    pub async fn start_orchestration_with_id(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let input = input.into();
        match self.store.create_instance(instance, orchestration, &input).await {
            Ok(()) => {
                tracing::info!(
                    target: "duratask::client",
                    instance_id = %instance,
                    orchestration_name = %orchestration,
                    "Orchestration started"
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => Err(ClientError::AlreadyExists(instance.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Start an orchestration with typed input (serialized to JSON).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Encode`] if `input` cannot be serialized.
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        input: In,
    ) -> Result<String, ClientError> {
        let payload = serde_json::to_string(&input).map_err(|e| ClientError::Encode(e.to_string()))?;
        self.start_orchestration(orchestration, payload).await
    }

    /// Current status derived from durable history.
    ///
    /// # Errors
    ///
    /// Provider failures other than a missing instance.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        match self.store.read(instance).await {
            Ok(history) => Ok(HistoryManager::from_history(&history).status()),
            Err(e) if e.is_instance_not_found() => Ok(OrchestrationStatus::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll status until the instance reaches a terminal state or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] on timeout, [`WaitError::Other`] if the instance
    /// does not exist or the provider fails.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            match self.get_orchestration_status(instance).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(OrchestrationStatus::NotFound) => {
                    return Err(WaitError::Other(format!("instance not found: {instance}")));
                }
                Ok(_) => {}
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Request termination. The orchestration dispatcher records
    /// `OrchestrationTerminated` on its next turn for this instance.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the instance does not exist or the enqueue fails.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        // Reject unknown instances up front rather than queueing an orphan message.
        self.store.read(instance).await?;
        self.store
            .enqueue_orchestrator_work(WorkItem::TerminateInstance {
                instance: instance.to_string(),
                reason: reason.into(),
            })
            .await?;
        Ok(())
    }

    /// Full ordered history, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] with kind `InstanceNotFound` for unknown instances.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read(instance).await?)
    }

    /// All known instance ids.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] on storage failure.
    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let client = Client::new(Arc::new(InMemoryProvider::new()));
        assert_eq!(
            client.get_orchestration_status("missing").await.unwrap(),
            OrchestrationStatus::NotFound
        );
        assert!(client.terminate_instance("missing", "x").await.is_err());
        assert!(matches!(
            client.wait_for_orchestration("missing", Duration::from_millis(10)).await,
            Err(WaitError::Other(_))
        ));
    }

    #[tokio::test]
    async fn start_allocates_unique_ids_and_is_running() {
        let client = Client::new(Arc::new(InMemoryProvider::new()));
        let a = client.start_orchestration("Orch", "1").await.unwrap();
        let b = client.start_orchestration("Orch", "1").await.unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
        assert_eq!(client.get_orchestration_status(&a).await.unwrap(), OrchestrationStatus::Running);
        assert!(matches!(
            client.wait_for_orchestration(&a, Duration::from_millis(20)).await,
            Err(WaitError::Timeout)
        ));
    }

    #[tokio::test]
    async fn duplicate_instance_id_is_rejected() {
        let client = Client::new(Arc::new(InMemoryProvider::new()));
        client.start_orchestration_with_id("fixed", "Orch", "").await.unwrap();
        assert_eq!(
            client.start_orchestration_with_id("fixed", "Orch", "").await,
            Err(ClientError::AlreadyExists("fixed".into()))
        );
    }

    #[tokio::test]
    async fn typed_start_encodes_json() {
        let client = Client::new(Arc::new(InMemoryProvider::new()));
        let id = client.start_orchestration_typed("Orch", vec![1, 2]).await.unwrap();
        let history = client.read_history(&id).await.unwrap();
        assert!(matches!(&history[0], Event::OrchestrationStarted { input, .. } if input == "[1,2]"));
    }
}
