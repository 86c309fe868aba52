//! At-least-once publishing of orchestration results

use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::broker::{BrokerProducer, TransportError};
use super::envelope::PublishEnvelope;
use crate::persistence::EventLogStore;
use crate::reliability::RetryPolicy;

/// Publish errors
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The output could not be encoded
    #[error("failed to serialize output: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every send attempt failed
    #[error("publish gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: TransportError,
    },
}

/// Sends terminal outputs to the configured topic
///
/// Sends are retried per the [`RetryPolicy`]. After the broker acknowledges,
/// the instance is marked published so recovery does not send it again. A
/// crash between the two sends it twice; consumers must tolerate duplicates.
pub struct ResultPublisher {
    producer: Arc<dyn BrokerProducer>,
    store: Arc<dyn EventLogStore>,
    topic: String,
    retry: RetryPolicy,
}

impl ResultPublisher {
    pub fn new(
        producer: Arc<dyn BrokerProducer>,
        store: Arc<dyn EventLogStore>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            store,
            topic: topic.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `output` of `instance_id`
    #[instrument(skip(self, output), fields(topic = %self.topic))]
    pub async fn publish(
        &self,
        instance_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<PublishEnvelope, PublishError> {
        let mut envelope = PublishEnvelope::new(instance_id, output)?;

        let offset = self
            .retry
            .run("publish", |_attempt| {
                self.producer.send(&self.topic, envelope.payload.clone())
            })
            .await
            .map_err(|exhausted| {
                error!(
                    %instance_id,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "giving up publishing result"
                );
                PublishError::Exhausted {
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error,
                }
            })?;

        envelope.acknowledge();
        info!(%instance_id, offset, "published result");

        if let Err(e) = self.store.mark_published(instance_id).await {
            warn!(%instance_id, error = %e, "published but could not record it; result may be sent again");
        }

        Ok(envelope)
    }
}
