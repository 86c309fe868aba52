//! Activity abstractions
//!
//! Activities are units of work scheduled by orchestrations and run by the
//! dispatcher. Their outcomes are recorded in history and fed back to the
//! orchestration on replay.

mod context;
mod definition;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError, ActivityErrorKind, ActivityResult};
pub use registry::{ActivityHandler, ActivityRegistry};
