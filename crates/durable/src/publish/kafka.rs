//! Kafka transport
//!
//! [`KafkaProducer`] and [`KafkaConsumer`] implement the broker traits on top
//! of librdkafka. Both are built from a [`BrokerConfig`]; the consumer never
//! auto-commits, so positions only advance through [`BrokerConsumer::commit`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, info};

use super::broker::{BrokerConsumer, BrokerMessage, BrokerProducer, TransportError};
use crate::config::BrokerConfig;

/// Time a send may wait in the local queue and for the broker's ack
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra wait for more messages once a batch has started
const BATCH_LINGER: Duration = Duration::from_millis(10);

fn transport_error(e: KafkaError) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

fn producer_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.broker_addresses)
        .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string());
    client
}

fn consumer_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.broker_addresses)
        .set("group.id", &config.group_id)
        .set("auto.offset.reset", config.offset_reset.to_string())
        .set("enable.auto.commit", "false");
    client
}

/// Producer acknowledged by the Kafka cluster
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: &BrokerConfig) -> Result<Self, TransportError> {
        let producer = producer_config(config)
            .create::<FutureProducer>()
            .map_err(transport_error)?;
        info!(brokers = %config.broker_addresses, "kafka producer created");
        Ok(Self { producer })
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u64, TransportError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_slice());

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "message acknowledged");
                Ok(offset.max(0) as u64)
            }
            Err((e, _)) => Err(transport_error(e)),
        }
    }
}

/// Group consumer subscribed to one topic
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &BrokerConfig) -> Result<Self, TransportError> {
        let consumer = consumer_config(config)
            .create::<StreamConsumer>()
            .map_err(transport_error)?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(transport_error)?;

        info!(
            brokers = %config.broker_addresses,
            topic = %config.topic,
            group_id = %config.group_id,
            offset_reset = %config.offset_reset,
            "kafka consumer subscribed"
        );
        Ok(Self { consumer })
    }
}

fn to_broker_message(message: &BorrowedMessage<'_>) -> BrokerMessage {
    BrokerMessage {
        topic: message.topic().to_string(),
        offset: message.offset().max(0) as u64,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<BrokerMessage>, TransportError> {
        let mut batch = Vec::new();

        while batch.len() < max {
            let limit = if batch.is_empty() { wait } else { BATCH_LINGER };
            match tokio::time::timeout(limit, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(transport_error(e)),
                Ok(Ok(message)) => batch.push(to_broker_message(&message)),
            }
        }

        Ok(batch)
    }

    /// Commits every partition position this consumer has read up to
    ///
    /// Kafka tracks positions per partition, so `next_offset` is only logged.
    async fn commit(&self, next_offset: u64) -> Result<(), TransportError> {
        debug!(next_offset, "committing consumed positions");
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(transport_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OffsetReset;

    fn config() -> BrokerConfig {
        BrokerConfig {
            broker_addresses: "kafka-1:9092,kafka-2:9092".to_string(),
            topic: "greetings".to_string(),
            group_id: "relay".to_string(),
            offset_reset: OffsetReset::Latest,
        }
    }

    #[test]
    fn test_consumer_config_uses_manual_commits() {
        let client = consumer_config(&config());

        assert_eq!(client.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(client.get("group.id"), Some("relay"));
        assert_eq!(client.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_producer_config() {
        let client = producer_config(&config());

        assert_eq!(client.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(client.get("message.timeout.ms"), Some("5000"));
        assert_eq!(client.get("group.id"), None);
    }

    #[test]
    fn test_default_offset_reset_is_earliest() {
        let client = consumer_config(&BrokerConfig::default());
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    /// Run with: KAFKA_BROKERS=localhost:9092 cargo test -p relay-durable --features kafka -- --ignored
    #[tokio::test]
    #[ignore = "requires Kafka"]
    async fn test_send_then_consume() {
        let brokers =
            std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
        let config = BrokerConfig {
            broker_addresses: brokers,
            topic: format!("relay-test-{}", uuid::Uuid::now_v7()),
            group_id: format!("relay-test-{}", uuid::Uuid::now_v7()),
            offset_reset: OffsetReset::Earliest,
        };

        let producer = KafkaProducer::new(&config).unwrap();
        producer
            .send(&config.topic, br#"["Hello Tokyo!"]"#.to_vec())
            .await
            .unwrap();

        let consumer = KafkaConsumer::new(&config).unwrap();
        let mut received = Vec::new();
        for _ in 0..20 {
            received.extend(consumer.fetch(10, Duration::from_millis(500)).await.unwrap());
            if !received.is_empty() {
                break;
            }
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload_lossy(), r#"["Hello Tokyo!"]"#);
        consumer.commit(received[0].offset + 1).await.unwrap();
    }
}
