//! Activity dispatch
//!
//! The [`ActivityDispatcher`] runs activities scheduled by the executor and
//! appends `ActivityCompleted` / `ActivityFailed` back to the event log.

mod dispatcher;

pub use dispatcher::{ActivityDispatcher, DispatchError, DispatcherConfig, Recorded};
