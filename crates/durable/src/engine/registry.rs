//! Orchestration registry for type-erased orchestration creation
//!
//! The registry maps orchestration names recorded in history to factories
//! that rebuild the orchestration from its recorded JSON input.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::orchestration::{
    ActivityOutcome, FanOutPolicy, Orchestration, OrchestrationAction, OrchestrationContext,
};

/// Type-erased orchestration interface
///
/// Lets the replay loop drive orchestrations without knowing their concrete
/// types.
pub trait AnyOrchestration: Send + Sync {
    /// Registered name
    fn name(&self) -> &'static str;

    /// Fan-out resolution policy
    fn fan_out(&self) -> FanOutPolicy;

    fn on_start(&mut self, ctx: &OrchestrationContext) -> Vec<OrchestrationAction>;

    fn on_activities_resolved(
        &mut self,
        ctx: &OrchestrationContext,
        outcomes: Vec<ActivityOutcome>,
    ) -> Vec<OrchestrationAction>;
}

struct OrchestrationWrapper<O: Orchestration> {
    inner: O,
}

impl<O: Orchestration> AnyOrchestration for OrchestrationWrapper<O> {
    fn name(&self) -> &'static str {
        O::NAME
    }

    fn fan_out(&self) -> FanOutPolicy {
        O::FAN_OUT
    }

    fn on_start(&mut self, ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
        self.inner.on_start(ctx)
    }

    fn on_activities_resolved(
        &mut self,
        ctx: &OrchestrationContext,
        outcomes: Vec<ActivityOutcome>,
    ) -> Vec<OrchestrationAction> {
        self.inner.on_activities_resolved(ctx, outcomes)
    }
}

/// Factory function type for creating orchestrations from JSON input
pub type OrchestrationFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyOrchestration>, serde_json::Error> + Send + Sync>;

/// Errors from registry lookups
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No factory registered under the name
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),

    /// Recorded input does not match the orchestration's input type
    #[error("invalid input for orchestration '{name}': {source}")]
    Deserialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Registry of orchestration factories
pub struct OrchestrationRegistry {
    factories: HashMap<String, OrchestrationFactory>,
}

impl Default for OrchestrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestrationRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an orchestration type
    ///
    /// Registering the same name twice replaces the earlier factory.
    pub fn register<O: Orchestration>(&mut self) {
        let factory: OrchestrationFactory = Box::new(|input: Value| {
            let typed_input: O::Input = serde_json::from_value(input)?;
            Ok(Box::new(OrchestrationWrapper {
                inner: O::new(typed_input),
            }) as Box<dyn AnyOrchestration>)
        });

        self.factories.insert(O::NAME.to_string(), factory);
    }

    /// Build an orchestration from its recorded name and input
    pub fn create(&self, name: &str, input: Value) -> Result<Box<dyn AnyOrchestration>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownOrchestration(name.to_string()))?;

        factory(input).map_err(|source| RegistryError::Deserialization {
            name: name.to_string(),
            source,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for OrchestrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationRegistry")
            .field("orchestrations", &self.names())
            .finish()
    }
}
