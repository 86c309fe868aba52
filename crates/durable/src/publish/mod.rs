//! Result publishing and consumption
//!
//! This module provides:
//! - [`ResultPublisher`] - at-least-once delivery of terminal outputs
//! - [`ResultConsumer`] - downstream consume loop with manual commits
//! - [`BrokerProducer`] / [`BrokerConsumer`] - broker client traits
//! - [`InMemoryBroker`] - in-process broker for tests and single-node runs
//! - `KafkaProducer` / `KafkaConsumer` - Kafka transport (`kafka` feature)

mod broker;
mod consumer;
mod envelope;
#[cfg(feature = "kafka")]
mod kafka;
mod publisher;

pub use broker::{
    BrokerConsumer, BrokerMessage, BrokerProducer, InMemoryBroker, InMemoryConsumer,
    TransportError,
};
pub use consumer::{ConsumeError, ConsumerConfig, ResultConsumer};
pub use envelope::PublishEnvelope;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaProducer};
pub use publisher::{PublishError, ResultPublisher};
