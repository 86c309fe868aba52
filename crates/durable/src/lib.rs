//! # Durable Orchestration Engine
//!
//! An event-sourced orchestration engine that survives restarts by replaying
//! recorded history.
//!
//! ## Features
//!
//! - **Event-sourced instances**: every decision and activity outcome is appended to a
//!   sequence-checked history, in PostgreSQL or in memory
//! - **Deterministic replay**: orchestration code re-runs from the start on every
//!   activation and is checked against what it did before
//! - **Fan-out/fan-in**: independent activities run concurrently, results are
//!   delivered in scheduling order
//! - **At-least-once publishing**: completed outputs are sent to a broker topic with
//!   retries and exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     InstanceManager                          │
//! │  (creates instances, queries status, waits for completion)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ activations
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  OrchestrationExecutor                       │
//! │  (replays history, appends new decisions, finishes)         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                      │
//!          ▼                   ▼                      ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌─────────────────────┐
//! │ EventLogStore  │  │ ActivityDispatcher│  │  ResultPublisher    │
//! │ (history,      │  │ (bounded, runs   │  │  (broker topic,     │
//! │  projections)  │  │  activities)     │  │   retry + backoff)  │
//! └────────────────┘  └──────────────────┘  └─────────────────────┘
//!                                                     │
//!                                                     ▼
//!                                           ┌─────────────────────┐
//!                                           │   ResultConsumer    │
//!                                           └─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use relay_durable::prelude::*;
//!
//! struct Greeter { names: Vec<String> }
//!
//! impl Orchestration for Greeter {
//!     const NAME: &'static str = "greeter";
//!     type Input = Vec<String>;
//!     type Output = Vec<String>;
//!
//!     fn new(names: Vec<String>) -> Self {
//!         Self { names }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &OrchestrationContext) -> Vec<OrchestrationAction> {
//!         self.names
//!             .iter()
//!             .map(|name| OrchestrationAction::schedule_activity("say_hello", json!(name)))
//!             .collect()
//!     }
//!
//!     // ... on_activities_resolved collects the greetings
//! }
//! ```

pub mod activity;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod orchestration;
pub mod persistence;
pub mod publish;
pub mod reliability;
pub mod runtime;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityResult};
    pub use crate::client::{ClientError, InstanceManager, InstanceState};
    pub use crate::config::{BrokerConfig, OffsetReset, RuntimeConfig};
    pub use crate::orchestration::{
        ActivityOutcome, FanOutPolicy, Orchestration, OrchestrationAction, OrchestrationContext,
        OrchestrationError,
    };
    pub use crate::persistence::{
        EventLogStore, InMemoryEventLogStore, InstanceStatus, PostgresEventLogStore, StoreError,
    };
    pub use crate::publish::{
        BrokerConsumer, BrokerMessage, BrokerProducer, InMemoryBroker, ResultConsumer,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{Runtime, RuntimeBuilder};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityErrorKind, ActivityRegistry};
pub use client::{ClientError, InstanceManager, InstanceState};
pub use config::{BrokerConfig, ConfigError, OffsetReset, RuntimeConfig};
pub use dispatch::{ActivityDispatcher, DispatcherConfig};
pub use engine::{ExecutorConfig, ExecutorError, OrchestrationExecutor, OrchestrationRegistry};
pub use orchestration::{
    ActivityOutcome, ActivityTask, FanOutPolicy, HistoryEvent, Orchestration, OrchestrationAction,
    OrchestrationContext, OrchestrationError, OrchestrationErrorKind, SequencedEvent,
};
pub use persistence::{
    EventLogStore, InMemoryEventLogStore, InstanceFilter, InstanceStatus, PostgresEventLogStore,
    StoreError,
};
pub use publish::{
    BrokerConsumer, BrokerMessage, BrokerProducer, InMemoryBroker, PublishEnvelope, PublishError,
    ResultConsumer, ResultPublisher, TransportError,
};
#[cfg(feature = "kafka")]
pub use publish::{KafkaConsumer, KafkaProducer};
pub use reliability::RetryPolicy;
pub use runtime::{Runtime, RuntimeBuilder};
