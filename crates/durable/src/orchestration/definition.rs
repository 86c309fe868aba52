//! Orchestration trait definition

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOutcome, OrchestrationAction};

/// Classification of orchestration failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationErrorKind {
    /// The orchestration logic decided to fail
    Application,

    /// Replay produced different decisions than the recorded history
    Nondeterminism,

    /// No orchestration registered under the recorded name
    UnknownOrchestration,

    /// The recorded input could not be decoded
    InvalidInput,

    /// The orchestration stopped issuing actions without finishing
    Stalled,
}

impl fmt::Display for OrchestrationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "application"),
            Self::Nondeterminism => write!(f, "nondeterminism"),
            Self::UnknownOrchestration => write!(f, "unknown_orchestration"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Stalled => write!(f, "stalled"),
        }
    }
}

/// Error recorded when an orchestration fails irrecoverably
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestrationError {
    /// Failure classification
    pub kind: OrchestrationErrorKind,

    /// Error message
    pub message: String,
}

impl OrchestrationError {
    /// Create an application-level failure
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(OrchestrationErrorKind::Application, message)
    }

    /// Create a failure with an explicit kind
    pub fn with_kind(kind: OrchestrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OrchestrationError {}

/// How a batch of concurrently scheduled activities resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Resume at the first recorded failure; unfinished siblings are reported
    /// as [`ActivityOutcome::Abandoned`]
    #[default]
    FailFast,

    /// Resume only once every activity in the batch has an outcome
    AllSettled,
}

/// Read-only view of the current activation handed to orchestration callbacks
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    instance_id: Uuid,
    replaying: bool,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: Uuid, replaying: bool) -> Self {
        Self {
            instance_id,
            replaying,
        }
    }

    /// Instance being executed
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Whether the callback is re-deriving decisions that are already recorded
    ///
    /// Use this only to suppress duplicate logging. Decisions must never
    /// depend on it.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }
}

/// An orchestration is a deterministic state machine over its history
///
/// The executor rebuilds an orchestration from its recorded input on every
/// activation and replays the recorded activity outcomes through these
/// callbacks. Callbacks must be pure functions of the instance input and the
/// outcomes they receive: no clocks, randomness, or I/O.
///
/// Every `ScheduleActivity` action returned from one callback forms one
/// awaited batch. The orchestration is resumed through
/// [`on_activities_resolved`](Orchestration::on_activities_resolved) once the
/// batch resolves according to [`FAN_OUT`](Orchestration::FAN_OUT), with
/// outcomes listed in the order the activities were scheduled.
///
/// # Example
///
/// ```ignore
/// use relay_durable::prelude::*;
///
/// struct Greeter { cities: Vec<String> }
///
/// impl Orchestration for Greeter {
///     const NAME: &'static str = "greeter";
///     type Input = Vec<String>;
///     type Output = Vec<String>;
///
///     fn new(cities: Self::Input) -> Self {
///         Self { cities }
///     }
///
///     fn on_start(&mut self, _ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
///         self.cities
///             .iter()
///             .map(|c| OrchestrationAction::schedule_activity("say_hello", json!(c)))
///             .collect()
///     }
///
///     // ... on_activities_resolved collects the greetings and completes
/// }
/// ```
pub trait Orchestration: Send + Sync + 'static {
    /// Unique name used to look up the orchestration during replay
    const NAME: &'static str;

    /// Fan-out resolution policy; part of the orchestration's deterministic logic
    const FAN_OUT: FanOutPolicy = FanOutPolicy::FailFast;

    /// Input type for starting the orchestration
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when the orchestration completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create an orchestration from its input
    fn new(input: Self::Input) -> Self;

    /// Called once at the beginning of every activation
    fn on_start(&mut self, ctx: &OrchestrationContext) -> Vec<OrchestrationAction>;

    /// Called when the awaited batch resolves
    fn on_activities_resolved(
        &mut self,
        ctx: &OrchestrationContext,
        outcomes: Vec<ActivityOutcome>,
    ) -> Vec<OrchestrationAction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestration_error_display() {
        let error = OrchestrationError::new("something went wrong");
        assert_eq!(error.to_string(), "application: something went wrong");
    }

    #[test]
    fn test_orchestration_error_with_kind() {
        let error = OrchestrationError::with_kind(OrchestrationErrorKind::Nondeterminism, "x");
        assert_eq!(error.kind, OrchestrationErrorKind::Nondeterminism);
    }

    #[test]
    fn test_default_fan_out_policy() {
        assert_eq!(FanOutPolicy::default(), FanOutPolicy::FailFast);
    }

    #[test]
    fn test_context_accessors() {
        let id = Uuid::now_v7();
        let ctx = OrchestrationContext::new(id, true);
        assert_eq!(ctx.instance_id(), id);
        assert!(ctx.is_replaying());
    }
}
