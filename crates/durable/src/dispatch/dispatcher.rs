//! Concurrent activity execution
//!
//! Runs scheduled activities with bounded concurrency and writes their
//! outcomes back to the event log through the sequence check.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashSet;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{
    ActivityContext, ActivityError, ActivityErrorKind, ActivityRegistry, ActivityResult,
};
use crate::orchestration::{ActivityTask, HistoryEvent};
use crate::persistence::{EventLogStore, StoreError};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum concurrently running activities
    pub max_concurrency: usize,

    /// How often an outcome append is retried after a sequence conflict
    pub max_append_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            max_append_retries: 16,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_max_append_retries(mut self, retries: u32) -> Self {
        self.max_append_retries = retries.max(1);
        self
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler registered under the scheduled name (recorded as a failure)
    #[error("no activity registered under '{0}'")]
    UnknownActivity(String),

    /// The activity ran and failed (recorded as a failure)
    #[error("activity failed: {0}")]
    Activity(ActivityError),

    /// The outcome could not be recorded
    #[error("failed to record activity outcome: {0}")]
    Store(#[from] StoreError),

    /// Every append attempt lost the sequence race
    #[error("gave up recording outcome for {instance_id} at sequence {sequence} after {attempts} conflicts")]
    AppendRetriesExhausted {
        instance_id: Uuid,
        sequence: u64,
        attempts: u32,
    },

    /// The task already has an outcome or its instance finished; it was not run
    #[error("task {instance_id}:{sequence} is already settled")]
    AlreadySettled { instance_id: Uuid, sequence: u64 },

    /// The dispatcher was closed
    #[error("dispatcher is shut down")]
    Closed,
}

/// What happened to an activity outcome on its way into history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Appended at the given sequence
    Appended(u64),

    /// An outcome for the same task was already recorded
    Duplicate,

    /// The instance finished before the outcome arrived
    InstanceTerminal,
}

/// Activity dispatcher
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(ActivityDispatcher::new(store, activities, DispatcherConfig::default()));
/// dispatcher.spawn(task);
/// ```
pub struct ActivityDispatcher {
    store: Arc<dyn EventLogStore>,
    activities: Arc<ActivityRegistry>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    in_flight: DashSet<(Uuid, u64)>,
    activations: Option<mpsc::UnboundedSender<Uuid>>,
}

impl ActivityDispatcher {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        activities: Arc<ActivityRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            activities,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            in_flight: DashSet::new(),
            activations: None,
        }
    }

    /// Re-queue instances on this channel after each recorded outcome
    pub fn with_activation_sender(mut self, activations: mpsc::UnboundedSender<Uuid>) -> Self {
        self.activations = Some(activations);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Number of tasks currently running or waiting for a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop accepting work; queued tasks fail with [`DispatchError::Closed`]
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `task` in the background
    ///
    /// Returns `false` when the same task is already in flight.
    pub fn spawn(self: &Arc<Self>, task: ActivityTask) -> bool {
        let key = (task.instance_id, task.sequence);
        if !self.in_flight.insert(key) {
            debug!(instance_id = %task.instance_id, sequence = task.sequence, "task already in flight");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let instance_id = task.instance_id;
            let sequence = task.sequence;

            let requeue = match this.dispatch(task).await {
                Ok(_) | Err(DispatchError::UnknownActivity(_)) | Err(DispatchError::Activity(_)) => true,
                Err(DispatchError::AlreadySettled { .. }) => false,
                Err(e) => {
                    error!(%instance_id, sequence, error = %e, "activity outcome was not recorded");
                    true
                }
            };

            this.in_flight.remove(&key);
            if requeue {
                this.requeue(instance_id);
            }
        });
        true
    }

    /// Run `task` and record its outcome
    ///
    /// Returns the activity's value, or the recorded failure as an error.
    /// A task whose outcome is already in history is not run again.
    #[instrument(skip(self, task), fields(instance_id = %task.instance_id, sequence = task.sequence, activity = %task.name))]
    pub async fn dispatch(&self, task: ActivityTask) -> Result<serde_json::Value, DispatchError> {
        let result = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| DispatchError::Closed)?;

            if self.is_settled(&task).await? {
                debug!("task already settled, not running it again");
                return Err(DispatchError::AlreadySettled {
                    instance_id: task.instance_id,
                    sequence: task.sequence,
                });
            }
            self.execute(&task).await
        };

        let event = match &result {
            Ok(value) => HistoryEvent::ActivityCompleted {
                sequence: task.sequence,
                result: value.clone(),
            },
            Err(error) => HistoryEvent::ActivityFailed {
                sequence: task.sequence,
                error: error.clone(),
            },
        };

        match self.record(&task, event).await? {
            Recorded::Appended(at) => debug!(at, "recorded activity outcome"),
            Recorded::Duplicate => info!("outcome already recorded, skipping duplicate"),
            Recorded::InstanceTerminal => info!("instance already finished, dropping outcome"),
        }

        result.map_err(|error| match error.kind {
            ActivityErrorKind::UnknownActivity => DispatchError::UnknownActivity(task.name),
            _ => DispatchError::Activity(error),
        })
    }

    /// An outcome for the task is recorded or its instance has finished
    async fn is_settled(&self, task: &ActivityTask) -> Result<bool, StoreError> {
        let history = self.store.read_history(task.instance_id).await?;
        Ok(history.iter().any(|e| {
            e.event.is_terminal() || e.event.outcome_sequence() == Some(task.sequence)
        }))
    }

    async fn execute(&self, task: &ActivityTask) -> ActivityResult {
        let Some(handler) = self.activities.get(&task.name) else {
            warn!(activity = %task.name, "no handler registered");
            return Err(ActivityError::unknown_activity(&task.name));
        };

        let ctx = ActivityContext::new(task.instance_id, task.sequence, task.name.clone());
        match AssertUnwindSafe(handler(ctx, task.input.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(activity = %task.name, "activity panicked");
                Err(ActivityError::execution("activity panicked"))
            }
        }
    }

    /// Append an outcome, re-reading history after every conflict
    async fn record(&self, task: &ActivityTask, event: HistoryEvent) -> Result<Recorded, DispatchError> {
        let instance_id = task.instance_id;

        for attempt in 1..=self.config.max_append_retries {
            let history = self.store.read_history(instance_id).await?;

            if history.iter().any(|e| e.event.is_terminal()) {
                return Ok(Recorded::InstanceTerminal);
            }
            if history
                .iter()
                .any(|e| e.event.outcome_sequence() == Some(task.sequence))
            {
                return Ok(Recorded::Duplicate);
            }

            let next = history.last().map(|e| e.sequence).unwrap_or(0) + 1;
            match self.store.append(instance_id, next, event.clone()).await {
                Ok(()) => return Ok(Recorded::Appended(next)),
                Err(StoreError::InstanceTerminal(_)) => return Ok(Recorded::InstanceTerminal),
                Err(e) if e.is_conflict() => {
                    debug!(attempt, error = %e, "outcome append conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DispatchError::AppendRetriesExhausted {
            instance_id,
            sequence: task.sequence,
            attempts: self.config.max_append_retries,
        })
    }

    fn requeue(&self, instance_id: Uuid) {
        if let Some(activations) = &self.activations {
            if activations.send(instance_id).is_err() {
                debug!(%instance_id, "activation queue closed");
            }
        }
    }
}
