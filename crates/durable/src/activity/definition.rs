//! Activity trait definition

use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Taxonomy of activity failures
///
/// Only the kind and a message are recorded in history. Stack traces and
/// source chains are dropped so replays see byte-identical events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    /// No handler registered under the scheduled name
    UnknownActivity,

    /// The activity input could not be decoded into the handler's input type
    InvalidInput,

    /// The activity body returned an error
    ExecutionError,
}

impl fmt::Display for ActivityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownActivity => write!(f, "unknown_activity"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::ExecutionError => write!(f, "execution_error"),
        }
    }
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityError {
    /// Failure classification
    pub kind: ActivityErrorKind,

    /// Human-readable description
    pub message: String,
}

impl ActivityError {
    /// Create an error raised by an activity body
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::ExecutionError,
            message: message.into(),
        }
    }

    /// Create an error for a name with no registered handler
    pub fn unknown_activity(name: &str) -> Self {
        Self {
            kind: ActivityErrorKind::UnknownActivity,
            message: format!("no activity registered under '{name}'"),
        }
    }

    /// Create an error for undecodable input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::InvalidInput,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::execution(err.to_string())
    }
}

/// Result produced by a type-erased activity invocation
pub type ActivityResult = Result<serde_json::Value, ActivityError>;

/// An activity is a single, independently invokable unit of work
///
/// Activities are stateless with respect to orchestration history and may run
/// concurrently on any worker. Only the dispatcher invokes them.
///
/// # Example
///
/// ```ignore
/// use relay_durable::prelude::*;
///
/// struct SayHello;
///
/// #[async_trait]
/// impl Activity for SayHello {
///     const NAME: &'static str = "say_hello";
///     type Input = String;
///     type Output = String;
///
///     async fn execute(
///         &self,
///         _ctx: &ActivityContext,
///         name: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(format!("Hello {name}!"))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Name used to schedule this activity and to look it up in the registry
    const NAME: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Any error is recorded as `ActivityFailed` and surfaced to the
    /// orchestration as a recoverable outcome.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
