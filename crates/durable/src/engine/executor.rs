//! Orchestration executor
//!
//! The `OrchestrationExecutor` is responsible for:
//! - Rebuilding an orchestration from its recorded start event
//! - Replaying the history and appending new decisions
//! - Handing newly scheduled activities to the dispatcher
//! - Handing terminal output to the publisher

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::registry::{OrchestrationRegistry, RegistryError};
use super::replay::{replay, Turn};
use crate::dispatch::ActivityDispatcher;
use crate::orchestration::{HistoryEvent, OrchestrationError, OrchestrationErrorKind};
use crate::persistence::{EventLogStore, InstanceStatus, StoreError};
use crate::publish::ResultPublisher;

/// Configuration for the orchestration executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Re-read-and-retry budget when an append loses the sequence race
    pub max_conflict_retries: u32,

    /// Histories longer than this are refused
    pub max_history_events: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 8,
            max_history_events: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_max_history_events(mut self, max: usize) -> Self {
        self.max_history_events = max;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// History does not start with `OrchestrationStarted`
    #[error("history of {0} is corrupt: {1}")]
    CorruptHistory(Uuid, String),

    /// Too many events
    #[error("instance {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Every attempt lost the sequence race
    #[error("instance {instance_id} kept conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { instance_id: Uuid, attempts: u32 },
}

/// What an activation ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Waiting on activities; `dispatched` were handed to the dispatcher
    Suspended { appended: usize, dispatched: usize },

    /// Completed in this activation
    Completed,

    /// Failed in this activation
    Failed(OrchestrationErrorKind),

    /// Already terminal before this activation
    AlreadyTerminal(InstanceStatus),
}

/// Orchestration executor
///
/// Each activation replays the whole history from scratch. The caller must
/// ensure only one activation per instance runs at a time; the sequence
/// check in the store catches outcome appends racing with it.
///
/// # Example
///
/// ```ignore
/// let executor = OrchestrationExecutor::new(store, registry, dispatcher)
///     .with_publisher(publisher);
///
/// executor.activate(instance_id).await?;
/// ```
pub struct OrchestrationExecutor {
    store: Arc<dyn EventLogStore>,
    registry: Arc<OrchestrationRegistry>,
    dispatcher: Arc<ActivityDispatcher>,
    publisher: Option<Arc<ResultPublisher>>,
    config: ExecutorConfig,
}

impl OrchestrationExecutor {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        registry: Arc<OrchestrationRegistry>,
        dispatcher: Arc<ActivityDispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            publisher: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<ResultPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventLogStore> {
        &self.store
    }

    pub fn registry(&self) -> &OrchestrationRegistry {
        &self.registry
    }

    /// Run one activation of `instance_id`
    #[instrument(skip(self))]
    pub async fn activate(&self, instance_id: Uuid) -> Result<Activation, ExecutorError> {
        let attempts = self.config.max_conflict_retries + 1;

        for attempt in 1..=attempts {
            match self.try_activate(instance_id).await {
                Err(ExecutorError::Store(e)) if is_retryable(&e) => {
                    debug!(%instance_id, attempt, error = %e, "activation lost a sequence race, replaying");
                }
                other => return other,
            }
        }

        warn!(%instance_id, attempts, "giving up activation after repeated conflicts");
        Err(ExecutorError::ConflictRetriesExhausted {
            instance_id,
            attempts,
        })
    }

    async fn try_activate(&self, instance_id: Uuid) -> Result<Activation, ExecutorError> {
        let history = self.store.read_history(instance_id).await?;

        if history.len() > self.config.max_history_events {
            return Err(ExecutorError::TooManyEvents(
                instance_id,
                history.len(),
                self.config.max_history_events,
            ));
        }

        let Some(HistoryEvent::OrchestrationStarted { name, input }) =
            history.first().map(|e| &e.event)
        else {
            return Err(ExecutorError::CorruptHistory(
                instance_id,
                "first event must be OrchestrationStarted".to_string(),
            ));
        };

        if let Some(last) = history.last().filter(|e| e.event.is_terminal()) {
            return self.already_terminal(instance_id, &last.event).await;
        }

        self.store.set_running(instance_id).await?;

        let turn = match self.registry.create(name, input.clone()) {
            Ok(mut orchestration) => replay(orchestration.as_mut(), instance_id, &history),
            Err(e) => {
                warn!(%instance_id, orchestration = %name, error = %e, "cannot build orchestration");
                let kind = match e {
                    RegistryError::UnknownOrchestration(_) => OrchestrationErrorKind::UnknownOrchestration,
                    RegistryError::Deserialization { .. } => OrchestrationErrorKind::InvalidInput,
                };
                Turn::Finished {
                    new_events: vec![HistoryEvent::OrchestrationFailed {
                        error: OrchestrationError::with_kind(kind, e.to_string()),
                    }],
                }
            }
        };

        let mut sequence = history.last().map(|e| e.sequence).unwrap_or(0);
        for event in turn.new_events() {
            sequence += 1;
            self.store.append(instance_id, sequence, event.clone()).await?;
        }
        let appended = turn.new_events().len();

        match turn {
            Turn::Suspended { pending, .. } => {
                let dispatched = pending
                    .into_iter()
                    .filter(|task| self.dispatcher.spawn(task.clone()))
                    .count();
                debug!(%instance_id, appended, dispatched, "orchestration suspended");
                Ok(Activation::Suspended {
                    appended,
                    dispatched,
                })
            }
            Turn::Finished { new_events } => match new_events.last() {
                Some(HistoryEvent::OrchestrationCompleted { output }) => {
                    info!(%instance_id, orchestration = %name, "orchestration completed");
                    self.publish(instance_id, output).await;
                    Ok(Activation::Completed)
                }
                Some(HistoryEvent::OrchestrationFailed { error }) => {
                    warn!(%instance_id, orchestration = %name, kind = %error.kind, error = %error.message, "orchestration failed");
                    Ok(Activation::Failed(error.kind))
                }
                _ => Err(ExecutorError::CorruptHistory(
                    instance_id,
                    "finished turn without a terminal event".to_string(),
                )),
            },
        }
    }

    /// Terminal instances only need their output published, if that never happened
    async fn already_terminal(
        &self,
        instance_id: Uuid,
        terminal: &HistoryEvent,
    ) -> Result<Activation, ExecutorError> {
        match terminal {
            HistoryEvent::OrchestrationCompleted { output } => {
                if self.publisher.is_some() && !self.store.instance_info(instance_id).await?.published {
                    info!(%instance_id, "republishing unacknowledged result");
                    self.publish(instance_id, output).await;
                }
                Ok(Activation::AlreadyTerminal(InstanceStatus::Completed))
            }
            _ => Ok(Activation::AlreadyTerminal(InstanceStatus::Failed)),
        }
    }

    /// Publish failures never change the terminal status
    async fn publish(&self, instance_id: Uuid, output: &serde_json::Value) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(instance_id, output).await {
                warn!(%instance_id, error = %e, "result left unpublished until the next activation or recovery");
            }
        }
    }
}

fn is_retryable(error: &StoreError) -> bool {
    error.is_conflict() || matches!(error, StoreError::InstanceTerminal(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityError, ActivityRegistry};
    use crate::dispatch::DispatcherConfig;
    use crate::orchestration::{
        ActivityOutcome, Orchestration, OrchestrationAction, OrchestrationContext,
    };
    use crate::persistence::InMemoryEventLogStore;
    use serde_json::json;

    /// Calls `count` once and completes with its value
    struct CountOnce;

    impl Orchestration for CountOnce {
        const NAME: &'static str = "count_once";
        type Input = ();
        type Output = i64;

        fn new(_: ()) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
            vec![OrchestrationAction::schedule_activity("count", json!(null))]
        }

        fn on_activities_resolved(
            &mut self,
            _ctx: &OrchestrationContext,
            outcomes: Vec<ActivityOutcome>,
        ) -> Vec<OrchestrationAction> {
            match &outcomes[0] {
                ActivityOutcome::Completed(value) => vec![OrchestrationAction::complete(value.clone())],
                ActivityOutcome::Failed(error) => {
                    vec![OrchestrationAction::fail(OrchestrationError::new(error.message.clone()))]
                }
                ActivityOutcome::Abandoned => vec![],
            }
        }
    }

    fn executor(store: Arc<InMemoryEventLogStore>, activities: ActivityRegistry) -> OrchestrationExecutor {
        let mut registry = OrchestrationRegistry::new();
        registry.register::<CountOnce>();
        let dispatcher = Arc::new(ActivityDispatcher::new(
            store.clone(),
            Arc::new(activities),
            DispatcherConfig::default(),
        ));
        OrchestrationExecutor::new(store, Arc::new(registry), dispatcher)
    }

    #[tokio::test]
    async fn test_first_activation_schedules_and_dispatches() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new());
        let id = Uuid::now_v7();
        store.create_instance(id, "count_once", json!(null)).await.unwrap();

        let activation = executor.activate(id).await.unwrap();

        assert_eq!(
            activation,
            Activation::Suspended {
                appended: 1,
                dispatched: 1
            }
        );
        assert_eq!(
            store.instance_info(id).await.unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_completes_once_outcome_recorded() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new());
        let id = Uuid::now_v7();
        store.create_instance(id, "count_once", json!(null)).await.unwrap();
        store
            .append(
                id,
                2,
                HistoryEvent::ActivityScheduled {
                    name: "count".to_string(),
                    input: json!(null),
                    sequence: 2,
                },
            )
            .await
            .unwrap();
        store
            .append(
                id,
                3,
                HistoryEvent::ActivityCompleted {
                    sequence: 2,
                    result: json!(7),
                },
            )
            .await
            .unwrap();

        assert_eq!(executor.activate(id).await.unwrap(), Activation::Completed);

        let info = store.instance_info(id).await.unwrap();
        assert_eq!(info.status, InstanceStatus::Completed);
        assert_eq!(info.output, Some(json!(7)));

        // A second activation is a no-op
        assert_eq!(
            executor.activate(id).await.unwrap(),
            Activation::AlreadyTerminal(InstanceStatus::Completed)
        );
        assert_eq!(store.read_history(id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_activity_failure_fails_orchestration() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new());
        let id = Uuid::now_v7();
        store.create_instance(id, "count_once", json!(null)).await.unwrap();
        store
            .append(
                id,
                2,
                HistoryEvent::ActivityScheduled {
                    name: "count".to_string(),
                    input: json!(null),
                    sequence: 2,
                },
            )
            .await
            .unwrap();
        store
            .append(
                id,
                3,
                HistoryEvent::ActivityFailed {
                    sequence: 2,
                    error: ActivityError::unknown_activity("count"),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            executor.activate(id).await.unwrap(),
            Activation::Failed(OrchestrationErrorKind::Application)
        );
        assert_eq!(
            store.instance_info(id).await.unwrap().status,
            InstanceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unknown_orchestration_is_recorded() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new());
        let id = Uuid::now_v7();
        store.create_instance(id, "retired", json!(null)).await.unwrap();

        assert_eq!(
            executor.activate(id).await.unwrap(),
            Activation::Failed(OrchestrationErrorKind::UnknownOrchestration)
        );

        let info = store.instance_info(id).await.unwrap();
        assert_eq!(
            info.error.map(|e| e.kind),
            Some(OrchestrationErrorKind::UnknownOrchestration)
        );
    }

    #[tokio::test]
    async fn test_invalid_input_is_recorded() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new());
        let id = Uuid::now_v7();
        store
            .create_instance(id, "count_once", json!({"unexpected": true}))
            .await
            .unwrap();

        assert_eq!(
            executor.activate(id).await.unwrap(),
            Activation::Failed(OrchestrationErrorKind::InvalidInput)
        );
    }

    #[tokio::test]
    async fn test_history_limit() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store.clone(), ActivityRegistry::new())
            .with_config(ExecutorConfig::default().with_max_history_events(0));
        let id = Uuid::now_v7();
        store.create_instance(id, "count_once", json!(null)).await.unwrap();

        assert!(matches!(
            executor.activate(id).await,
            Err(ExecutorError::TooManyEvents(_, 1, 0))
        ));
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_completion_and_retries_later() {
        use crate::publish::{InMemoryBroker, ResultPublisher};
        use crate::reliability::RetryPolicy;

        let store = Arc::new(InMemoryEventLogStore::new());
        let broker = InMemoryBroker::new();
        let publisher = ResultPublisher::new(Arc::new(broker.clone()), store.clone(), "results")
            .with_retry_policy(RetryPolicy::no_retry());
        let executor = executor(store.clone(), ActivityRegistry::new())
            .with_publisher(Arc::new(publisher));

        let id = Uuid::now_v7();
        store.create_instance(id, "count_once", json!(null)).await.unwrap();
        for (sequence, event) in [
            (
                2,
                HistoryEvent::ActivityScheduled {
                    name: "count".to_string(),
                    input: json!(null),
                    sequence: 2,
                },
            ),
            (
                3,
                HistoryEvent::ActivityCompleted {
                    sequence: 2,
                    result: json!(7),
                },
            ),
        ] {
            store.append(id, sequence, event).await.unwrap();
        }

        broker.fail_next_sends(1);
        assert_eq!(executor.activate(id).await.unwrap(), Activation::Completed);
        assert!(broker.messages("results").is_empty());
        assert!(!store.instance_info(id).await.unwrap().published);

        assert_eq!(
            executor.activate(id).await.unwrap(),
            Activation::AlreadyTerminal(InstanceStatus::Completed)
        );
        assert_eq!(broker.messages("results").len(), 1);
        assert!(store.instance_info(id).await.unwrap().published);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let executor = executor(store, ActivityRegistry::new());

        assert!(matches!(
            executor.activate(Uuid::now_v7()).await,
            Err(ExecutorError::Store(StoreError::InstanceNotFound(_)))
        ));
    }
}
