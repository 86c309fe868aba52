//! History events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrchestrationError;
use crate::activity::ActivityError;

/// Events stored in an instance's append-only history
///
/// These events are the single source of truth for an instance. They are used for:
/// - Replaying the orchestration on every activation
/// - Deriving instance status
/// - Auditing and debugging
///
/// Events are immutable once written. Each occupies exactly one sequence
/// number; an `ActivityScheduled` event's `sequence` is the position it was
/// appended at, and outcomes refer back to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Instance created with the given orchestration name and input
    OrchestrationStarted {
        /// Registered orchestration name
        name: String,

        /// Input provided at creation
        input: serde_json::Value,
    },

    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Registered activity name
        name: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Sequence number identifying this task
        sequence: u64,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Sequence of the matching `ActivityScheduled`
        sequence: u64,

        /// Value returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed
    ActivityFailed {
        /// Sequence of the matching `ActivityScheduled`
        sequence: u64,

        /// Error kind and message
        error: ActivityError,
    },

    /// Orchestration completed successfully
    OrchestrationCompleted {
        /// Final output
        output: serde_json::Value,
    },

    /// Orchestration failed irrecoverably
    OrchestrationFailed {
        /// Error details
        error: OrchestrationError,
    },
}

impl HistoryEvent {
    /// Short name used as the `event_type` column
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::OrchestrationStarted { .. } => "orchestration_started",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::OrchestrationCompleted { .. } => "orchestration_completed",
            Self::OrchestrationFailed { .. } => "orchestration_failed",
        }
    }

    /// Sequence of the scheduled activity an outcome refers to
    pub fn outcome_sequence(&self) -> Option<u64> {
        match self {
            Self::ActivityCompleted { sequence, .. } | Self::ActivityFailed { sequence, .. } => {
                Some(*sequence)
            }
            _ => None,
        }
    }

    /// Check if this is a terminal orchestration event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OrchestrationCompleted { .. } | Self::OrchestrationFailed { .. }
        )
    }
}

/// A history event together with its position in the log
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    /// Position in the instance history (1-based, gapless)
    pub sequence: u64,

    /// The recorded event
    pub event: HistoryEvent,

    /// When the event was durably written
    pub recorded_at: DateTime<Utc>,
}

/// A unit of dispatched work
///
/// Created by the executor from an `ActivityScheduled` event and consumed by
/// the dispatcher. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub instance_id: Uuid,
    pub sequence: u64,
    pub name: String,
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_event_serialization() {
        let event = HistoryEvent::OrchestrationStarted {
            name: "greeter".to_string(),
            input: json!(null),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"orchestration_started\""));

        let parsed: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_outcome_sequence_extraction() {
        let event = HistoryEvent::ActivityFailed {
            sequence: 4,
            error: ActivityError::execution("nope"),
        };
        assert_eq!(event.outcome_sequence(), Some(4));

        let scheduled = HistoryEvent::ActivityScheduled {
            name: "a".to_string(),
            input: json!(null),
            sequence: 2,
        };
        assert_eq!(scheduled.outcome_sequence(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(HistoryEvent::OrchestrationCompleted { output: json!([]) }.is_terminal());
        assert!(HistoryEvent::OrchestrationFailed {
            error: OrchestrationError::new("error")
        }
        .is_terminal());

        assert!(!HistoryEvent::ActivityCompleted {
            sequence: 2,
            result: json!({})
        }
        .is_terminal());
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = HistoryEvent::ActivityCompleted {
            sequence: 2,
            result: json!("ok"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
    }
}
