//! Activity execution context

use uuid::Uuid;

/// Context provided to activities during execution
///
/// Identifies which scheduling decision the running body belongs to. The
/// `(instance_id, sequence)` pair is unique per task and can be used as an
/// idempotency key by activities with external side effects, since a task may
/// be delivered more than once after a crash.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Orchestration instance that scheduled this activity
    pub instance_id: Uuid,

    /// Sequence number of the `ActivityScheduled` event
    pub sequence: u64,

    /// Registered activity name
    pub name: String,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(instance_id: Uuid, sequence: u64, name: impl Into<String>) -> Self {
        Self {
            instance_id,
            sequence,
            name: name.into(),
        }
    }

    /// Stable key identifying this task across redeliveries
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance_id, self.sequence)
    }
}
