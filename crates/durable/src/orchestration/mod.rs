//! Orchestration abstractions and types
//!
//! This module contains the core orchestration primitives:
//! - [`Orchestration`] trait for defining deterministic state machines
//! - [`OrchestrationAction`] enum for orchestration decisions
//! - [`HistoryEvent`] enum for persisted history
//! - [`ActivityTask`] for dispatched work

mod action;
mod definition;
mod event;

pub use action::{ActivityOutcome, OrchestrationAction};
pub use definition::{
    FanOutPolicy, Orchestration, OrchestrationContext, OrchestrationError,
    OrchestrationErrorKind,
};
pub use event::{ActivityTask, HistoryEvent, SequencedEvent};
