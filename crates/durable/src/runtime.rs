//! Runtime wiring: activation queue, per-instance locks and recovery

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::activity::{Activity, ActivityContext, ActivityRegistry, ActivityResult};
use crate::client::InstanceManager;
use crate::config::RuntimeConfig;
use crate::dispatch::ActivityDispatcher;
use crate::engine::{Activation, OrchestrationExecutor, OrchestrationRegistry};
use crate::orchestration::Orchestration;
use crate::persistence::{EventLogStore, InstanceFilter, StoreError};
use crate::publish::{BrokerProducer, ResultPublisher};

type InstanceLocks = DashMap<Uuid, Arc<Mutex<()>>>;

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    store: Arc<dyn EventLogStore>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    producer: Option<(Arc<dyn BrokerProducer>, String)>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new(store: Arc<dyn EventLogStore>) -> Self {
        Self {
            store,
            orchestrations: OrchestrationRegistry::new(),
            activities: ActivityRegistry::new(),
            producer: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn register_orchestration<O: Orchestration>(mut self) -> Self {
        self.orchestrations.register::<O>();
        info!(orchestration = O::NAME, "registered orchestration");
        self
    }

    pub fn register_activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        info!(activity = A::NAME, "registered activity");
        self
    }

    pub fn register_activity_fn<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        self.activities.register_fn(name, handler);
        info!(activity = name, "registered activity");
        self
    }

    /// Publish completed outputs to `topic` through `producer`
    pub fn with_publisher(mut self, producer: Arc<dyn BrokerProducer>, topic: impl Into<String>) -> Self {
        self.producer = Some((producer, topic.into()));
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire the components and start the activation loop
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> Runtime {
        let (activations_tx, activations_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(self.orchestrations);
        let dispatcher = Arc::new(
            ActivityDispatcher::new(
                Arc::clone(&self.store),
                Arc::new(self.activities),
                self.config.dispatcher.clone(),
            )
            .with_activation_sender(activations_tx.clone()),
        );

        let mut executor = OrchestrationExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        )
        .with_config(self.config.executor.clone());

        if let Some((producer, topic)) = self.producer {
            let publisher = ResultPublisher::new(producer, Arc::clone(&self.store), topic)
                .with_retry_policy(self.config.publish_retry.clone());
            executor = executor.with_publisher(Arc::new(publisher));
        }

        let executor = Arc::new(executor);
        let locks = Arc::new(InstanceLocks::new());

        let loop_handle = tokio::spawn(activation_loop(
            Arc::clone(&executor),
            Arc::clone(&locks),
            activations_rx,
            shutdown_rx,
        ));

        info!(orchestrations = ?registry.names(), "runtime started");

        Runtime {
            store: self.store,
            registry,
            executor,
            dispatcher,
            activations: activations_tx,
            shutdown_tx,
            loop_handle: Mutex::new(Some(loop_handle)),
        }
    }
}

/// A running engine
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::builder(Arc::new(InMemoryEventLogStore::new()))
///     .register_orchestration::<HelloCities>()
///     .register_activity(SayHello)
///     .with_publisher(Arc::new(broker.clone()), "durable-function-output")
///     .start();
///
/// runtime.recover().await?;
/// let id = runtime.client().create::<HelloCities>(cities).await?;
/// ```
pub struct Runtime {
    store: Arc<dyn EventLogStore>,
    registry: Arc<OrchestrationRegistry>,
    executor: Arc<OrchestrationExecutor>,
    dispatcher: Arc<ActivityDispatcher>,
    activations: mpsc::UnboundedSender<Uuid>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder(store: Arc<dyn EventLogStore>) -> RuntimeBuilder {
        RuntimeBuilder::new(store)
    }

    /// Instance manager bound to this runtime
    pub fn client(&self) -> InstanceManager {
        InstanceManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.activations.clone(),
        )
    }

    pub fn store(&self) -> &Arc<dyn EventLogStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<OrchestrationExecutor> {
        &self.executor
    }

    /// Queue an activation of `instance_id`
    pub fn activate(&self, instance_id: Uuid) {
        if self.activations.send(instance_id).is_err() {
            debug!(%instance_id, "runtime stopped, activation dropped");
        }
    }

    /// Re-queue every unfinished and every completed-but-unpublished instance
    ///
    /// Call once after start to resume work left by a previous process.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut instances = self.store.list_instances(InstanceFilter::active()).await?;
        instances.extend(self.store.list_instances(InstanceFilter::unpublished()).await?);

        for info in &instances {
            self.activate(info.id);
        }

        info!(count = instances.len(), "recovered instances");
        Ok(instances.len())
    }

    /// Stop accepting activations and wait for running ones to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.close();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "activation loop panicked");
            }
        }
        info!("runtime stopped");
    }
}

async fn activation_loop(
    executor: Arc<OrchestrationExecutor>,
    locks: Arc<InstanceLocks>,
    mut activations: mpsc::UnboundedReceiver<Uuid>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = running.join_next(), if !running.is_empty() => {}
            next = activations.recv() => {
                let Some(instance_id) = next else { break };
                running.spawn(run_activation(Arc::clone(&executor), Arc::clone(&locks), instance_id));
            }
        }
    }

    debug!(running = running.len(), "draining activations");
    while running.join_next().await.is_some() {}
}

async fn run_activation(executor: Arc<OrchestrationExecutor>, locks: Arc<InstanceLocks>, instance_id: Uuid) {
    let lock = Arc::clone(locks.entry(instance_id).or_default().value());

    {
        let _guard = lock.lock().await;
        match executor.activate(instance_id).await {
            Ok(Activation::Suspended { dispatched, .. }) => {
                debug!(%instance_id, dispatched, "activation suspended");
            }
            Ok(outcome) => debug!(%instance_id, ?outcome, "activation finished"),
            Err(e) => error!(%instance_id, error = %e, "activation failed"),
        }
    }

    drop(lock);
    locks.remove_if(&instance_id, |_, lock| Arc::strong_count(lock) == 1);
}
