//! Orchestration execution engine
//!
//! The engine module provides the [`OrchestrationExecutor`], which rebuilds
//! orchestrations from history through the [`OrchestrationRegistry`] and
//! drives them with deterministic [`replay`].

mod executor;
mod registry;
mod replay;

pub use executor::{Activation, ExecutorConfig, ExecutorError, OrchestrationExecutor};
pub use registry::{AnyOrchestration, OrchestrationFactory, OrchestrationRegistry, RegistryError};
pub use replay::{replay, Turn};
