//! Downstream consume loop for published results

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::broker::{BrokerConsumer, BrokerMessage, TransportError};

/// Consume errors
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Fetching or committing failed; the loop stops
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}

/// Consumer loop settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum messages handled between commits
    pub batch_size: usize,

    /// How long a fetch waits for new messages
    pub poll_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_wait: Duration::from_secs(1),
        }
    }
}

/// Reads published results and hands each message to a handler
///
/// Offsets are committed after every handled batch, so a crash replays at
/// most one batch (at-least-once).
pub struct ResultConsumer {
    consumer: Box<dyn BrokerConsumer>,
    config: ConsumerConfig,
}

impl ResultConsumer {
    pub fn new(consumer: Box<dyn BrokerConsumer>) -> Self {
        Self {
            consumer,
            config: ConsumerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until `shutdown` flips to `true` or the transport fails
    ///
    /// Data messages never end the loop.
    pub async fn run<H, Fut>(
        &self,
        mut handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConsumeError>
    where
        H: FnMut(BrokerMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!("result consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                fetched = self.consumer.fetch(self.config.batch_size, self.config.poll_wait) => {
                    fetched.map_err(|e| {
                        error!(error = %e, "fetch failed");
                        ConsumeError::from(e)
                    })?
                }
            };

            let Some(next_offset) = batch.last().map(|m| m.offset + 1) else {
                continue;
            };

            debug!(count = batch.len(), next_offset, "handling batch");
            for message in batch {
                handler(message).await;
            }
            self.consumer.commit(next_offset).await?;
        }

        info!("result consumer stopped");
        Ok(())
    }
}
