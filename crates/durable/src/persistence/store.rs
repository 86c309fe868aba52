//! EventLogStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestration::{HistoryEvent, OrchestrationError, SequencedEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Instance id already in use
    #[error("instance already exists: {0}")]
    AlreadyExists(Uuid),

    /// Sequence check failed (duplicate or out-of-order write)
    ///
    /// `expected` is the sequence the caller tried to write, `actual` the one
    /// the store would have accepted.
    #[error("concurrency conflict on {instance_id}: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict {
        instance_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// History already ends in a terminal event
    #[error("instance {0} already reached a terminal state")]
    InstanceTerminal(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, not yet activated
    Pending,

    /// Activated at least once, not terminal
    Running,

    /// Completed successfully
    Completed,

    /// Failed
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status projection after appending `event`
    pub fn after(self, event: &HistoryEvent) -> Self {
        match event {
            HistoryEvent::OrchestrationCompleted { .. } => Self::Completed,
            HistoryEvent::OrchestrationFailed { .. } => Self::Failed,
            HistoryEvent::OrchestrationStarted { .. } => Self::Pending,
            _ => Self::Running,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown instance status: {other}"
            ))),
        }
    }
}

/// Instance metadata and terminal projection
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<OrchestrationError>,
    /// Whether the output has been acknowledged by the broker
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Statuses to include (empty = all)
    pub statuses: Vec<InstanceStatus>,

    /// Only instances whose output is not yet published
    pub unpublished_only: bool,
}

impl InstanceFilter {
    /// Instances that still need activations
    pub fn active() -> Self {
        Self {
            statuses: vec![InstanceStatus::Pending, InstanceStatus::Running],
            unpublished_only: false,
        }
    }

    /// Completed instances whose output was never acknowledged
    pub fn unpublished() -> Self {
        Self {
            statuses: vec![InstanceStatus::Completed],
            unpublished_only: true,
        }
    }

    pub fn matches(&self, info: &InstanceInfo) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&info.status))
            && (!self.unpublished_only || !info.published)
    }
}

/// Durable, append-only store of instance histories
///
/// Implementations must be thread-safe. `append` is the sole synchronization
/// point between the executor and concurrently completing activities: a
/// successful return means the event is durable and is the commit point for
/// the decision it records.
#[async_trait]
pub trait EventLogStore: Send + Sync + 'static {
    /// Create an instance and record `OrchestrationStarted` at sequence 1
    async fn create_instance(
        &self,
        instance_id: Uuid,
        name: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Append one event at `sequence`, which must be exactly one greater than
    /// the last recorded sequence
    async fn append(
        &self,
        instance_id: Uuid,
        sequence: u64,
        event: HistoryEvent,
    ) -> Result<(), StoreError>;

    /// Load the full ordered history (for replay)
    async fn read_history(&self, instance_id: Uuid) -> Result<Vec<SequencedEvent>, StoreError>;

    /// Get instance metadata
    async fn instance_info(&self, instance_id: Uuid) -> Result<InstanceInfo, StoreError>;

    /// Move a pending instance to running (no-op otherwise)
    async fn set_running(&self, instance_id: Uuid) -> Result<(), StoreError>;

    /// Record that the instance output was acknowledged by the broker
    async fn mark_published(&self, instance_id: Uuid) -> Result<(), StoreError>;

    /// List instances matching `filter`
    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<InstanceInfo>, StoreError>;
}
