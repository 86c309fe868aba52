//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`EventLogStore`] trait for instance histories
//! - [`InMemoryEventLogStore`] for testing and single-process runs
//! - [`PostgresEventLogStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventLogStore;
pub use postgres::PostgresEventLogStore;
pub use store::{EventLogStore, InstanceFilter, InstanceInfo, InstanceStatus, StoreError};
