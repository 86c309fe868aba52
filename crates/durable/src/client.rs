//! Instance manager: create instances and query their status

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::OrchestrationRegistry;
use crate::orchestration::{Orchestration, OrchestrationError, SequencedEvent};
use crate::persistence::{EventLogStore, InstanceFilter, InstanceInfo, InstanceStatus, StoreError};

/// Errors from instance management
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Store error (includes `InstanceNotFound`)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No orchestration registered under the name
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),

    /// Input could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The instance did not finish in time
    #[error("instance {instance_id} not finished after {waited:?}")]
    Timeout { instance_id: Uuid, waited: Duration },
}

/// Externally visible state of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub instance_id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<OrchestrationError>,
    pub created_at: DateTime<Utc>,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Decode the output into the orchestration's output type
    pub fn output_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.output.clone().map(serde_json::from_value)
    }
}

impl From<InstanceInfo> for InstanceState {
    fn from(info: InstanceInfo) -> Self {
        Self {
            instance_id: info.id,
            name: info.name,
            status: info.status,
            output: info.output,
            error: info.error,
            created_at: info.created_at,
        }
    }
}

/// The outward boundary of the engine
///
/// Cheap to clone; all clones share the store and activation queue.
#[derive(Clone)]
pub struct InstanceManager {
    store: Arc<dyn EventLogStore>,
    registry: Arc<OrchestrationRegistry>,
    activations: mpsc::UnboundedSender<Uuid>,
    poll_interval: Duration,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        registry: Arc<OrchestrationRegistry>,
        activations: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            store,
            registry,
            activations,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Status polling interval used by [`wait_for_completion`](Self::wait_for_completion)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a new instance of `O`
    pub async fn create<O: Orchestration>(&self, input: O::Input) -> Result<Uuid, ClientError> {
        let input = serde_json::to_value(input)?;
        self.create_by_name(O::NAME, input).await
    }

    /// Start a new instance of the orchestration registered under `name`
    #[instrument(skip(self, input))]
    pub async fn create_by_name(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, ClientError> {
        if !self.registry.contains(name) {
            return Err(ClientError::UnknownOrchestration(name.to_string()));
        }

        let instance_id = Uuid::now_v7();
        self.store.create_instance(instance_id, name, input).await?;
        info!(%instance_id, orchestration = %name, "created instance");

        if self.activations.send(instance_id).is_err() {
            warn!(%instance_id, "runtime is stopped; instance runs after recovery");
        }
        Ok(instance_id)
    }

    /// Current status and, once terminal, output or error
    pub async fn get_status(&self, instance_id: Uuid) -> Result<InstanceState, ClientError> {
        Ok(self.store.instance_info(instance_id).await?.into())
    }

    /// Poll until the instance is terminal or `timeout` expires
    pub async fn wait_for_completion(
        &self,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<InstanceState, ClientError> {
        match tokio::time::timeout(timeout, self.poll_until_terminal(instance_id)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                instance_id,
                waited: timeout,
            }),
        }
    }

    async fn poll_until_terminal(&self, instance_id: Uuid) -> Result<InstanceState, ClientError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let state = self.get_status(instance_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    /// Full recorded history, for diagnostics
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<SequencedEvent>, ClientError> {
        Ok(self.store.read_history(instance_id).await?)
    }

    /// Instances matching `filter`
    pub async fn list(&self, filter: InstanceFilter) -> Result<Vec<InstanceState>, ClientError> {
        Ok(self
            .store
            .list_instances(filter)
            .await?
            .into_iter()
            .map(InstanceState::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{ActivityOutcome, OrchestrationAction, OrchestrationContext};
    use crate::persistence::InMemoryEventLogStore;
    use crate::HistoryEvent;
    use serde_json::json;

    struct Noop;

    impl Orchestration for Noop {
        const NAME: &'static str = "noop";
        type Input = u32;
        type Output = u32;

        fn new(_: u32) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
            vec![OrchestrationAction::complete(json!(0))]
        }

        fn on_activities_resolved(
            &mut self,
            _ctx: &OrchestrationContext,
            _outcomes: Vec<ActivityOutcome>,
        ) -> Vec<OrchestrationAction> {
            vec![]
        }
    }

    fn manager() -> (Arc<InMemoryEventLogStore>, InstanceManager, mpsc::UnboundedReceiver<Uuid>) {
        let store = Arc::new(InMemoryEventLogStore::new());
        let mut registry = OrchestrationRegistry::new();
        registry.register::<Noop>();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = InstanceManager::new(store.clone(), Arc::new(registry), tx)
            .with_poll_interval(Duration::from_millis(5));
        (store, manager, rx)
    }

    #[tokio::test]
    async fn test_create_queues_activation() {
        let (store, manager, mut rx) = manager();

        let id = manager.create::<Noop>(3).await.unwrap();

        assert_eq!(rx.recv().await, Some(id));
        let state = manager.get_status(id).await.unwrap();
        assert_eq!(state.status, InstanceStatus::Pending);
        assert_eq!(state.name, "noop");
        assert_eq!(store.read_history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_unknown_name() {
        let (_store, manager, _rx) = manager();
        let result = manager.create_by_name("missing", json!(null)).await;
        assert!(matches!(result, Err(ClientError::UnknownOrchestration(_))));
    }

    #[tokio::test]
    async fn test_status_of_unknown_instance() {
        let (_store, manager, _rx) = manager();
        let result = manager.get_status(Uuid::now_v7()).await;
        assert!(matches!(
            result,
            Err(ClientError::Store(StoreError::InstanceNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let (store, manager, _rx) = manager();
        let id = manager.create::<Noop>(1).await.unwrap();

        let timed_out = manager
            .wait_for_completion(id, Duration::from_millis(20))
            .await;
        assert!(matches!(timed_out, Err(ClientError::Timeout { .. })));

        store
            .append(id, 2, HistoryEvent::OrchestrationCompleted { output: json!(0) })
            .await
            .unwrap();

        let state = manager
            .wait_for_completion(id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state.status, InstanceStatus::Completed);
        assert_eq!(state.output_as::<u32>().unwrap().unwrap(), 0);
    }
}
