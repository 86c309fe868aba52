//! Orchestration actions and activity outcomes

use serde::{Deserialize, Serialize};

use super::OrchestrationError;
use crate::activity::ActivityError;

/// Actions an orchestration can request
///
/// Each action is persisted as a [`HistoryEvent`](super::HistoryEvent) before
/// any side effect happens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Registered activity name
        name: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,
    },

    /// Complete the orchestration successfully with an output
    CompleteOrchestration {
        /// Output value (JSON)
        output: serde_json::Value,
    },

    /// Fail the orchestration with an error
    FailOrchestration {
        /// Error details
        error: OrchestrationError,
    },
}

impl OrchestrationAction {
    /// Create a schedule activity action
    pub fn schedule_activity(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ScheduleActivity {
            name: name.into(),
            input,
        }
    }

    /// Create a complete orchestration action
    pub fn complete(output: serde_json::Value) -> Self {
        Self::CompleteOrchestration { output }
    }

    /// Create a fail orchestration action
    pub fn fail(error: OrchestrationError) -> Self {
        Self::FailOrchestration { error }
    }
}

/// Outcome of one scheduled activity as seen by the orchestration
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// The activity returned a value
    Completed(serde_json::Value),

    /// The activity failed; the orchestration may retry or give up
    Failed(ActivityError),

    /// The batch resolved before this activity finished (fail-fast fan-out)
    Abandoned,
}

impl ActivityOutcome {
    /// Returns the completed value, if any
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the failure, if any
    pub fn error(&self) -> Option<&ActivityError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action = OrchestrationAction::schedule_activity("say_hello", json!("Tokyo"));

        match action {
            OrchestrationAction::ScheduleActivity { name, input } => {
                assert_eq!(name, "say_hello");
                assert_eq!(input, json!("Tokyo"));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_action_serialization_tag() {
        let action = OrchestrationAction::complete(json!(["a"]));
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"complete_orchestration\""));
    }

    #[test]
    fn test_outcome_accessors() {
        let done = ActivityOutcome::Completed(json!(1));
        assert_eq!(done.value(), Some(&json!(1)));
        assert!(done.error().is_none());
        assert!(done.is_completed());

        let failed = ActivityOutcome::Failed(ActivityError::execution("x"));
        assert!(failed.value().is_none());
        assert!(failed.error().is_some());

        assert!(!ActivityOutcome::Abandoned.is_completed());
    }
}
