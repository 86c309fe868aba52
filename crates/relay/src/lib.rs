//! Greeting worker built on `relay-durable`
//!
//! Runs the `hello_cities` orchestration, publishes its output to the result
//! topic and consumes that topic.

pub mod greetings;
pub mod telemetry;

use std::sync::Arc;

use relay_durable::{BrokerProducer, EventLogStore, Runtime, RuntimeConfig};

pub use greetings::{HelloCities, SayHello, DEFAULT_CITIES};

/// Runtime with the greeting orchestration and activity registered
pub fn greeting_runtime(
    store: Arc<dyn EventLogStore>,
    producer: Arc<dyn BrokerProducer>,
    topic: &str,
    config: RuntimeConfig,
) -> Runtime {
    Runtime::builder(store)
        .register_orchestration::<HelloCities>()
        .register_activity(SayHello)
        .with_publisher(producer, topic)
        .with_config(config)
        .start()
}
