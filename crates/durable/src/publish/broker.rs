//! Broker transport
//!
//! Producers and consumers talk to the broker through [`BrokerProducer`] and
//! [`BrokerConsumer`]. [`InMemoryBroker`] implements both in-process with
//! topic logs, per-group committed offsets and injectable faults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{BrokerConfig, OffsetReset};

/// Errors from the broker transport
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached or rejected the request
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The client was closed
    #[error("broker client closed")]
    Closed,
}

/// A message read from a topic
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl BrokerMessage {
    /// Payload as text, replacing invalid UTF-8
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Sending side of the broker
#[async_trait]
pub trait BrokerProducer: Send + Sync + 'static {
    /// Send one message and wait for the broker's acknowledgement
    ///
    /// Returns the offset the message was stored at.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u64, TransportError>;
}

/// Receiving side of the broker, bound to one topic and consumer group
#[async_trait]
pub trait BrokerConsumer: Send + Sync + 'static {
    /// Fetch up to `max` messages, waiting at most `wait` when none are ready
    ///
    /// An empty batch means the wait elapsed.
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<BrokerMessage>, TransportError>;

    /// Commit `next_offset` as the group's position
    async fn commit(&self, next_offset: u64) -> Result<(), TransportError>;
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<BrokerMessage>>,
    committed: HashMap<(String, String), u64>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    appended: Notify,
    failing_sends: AtomicU32,
    failing_fetches: AtomicU32,
}

/// In-process broker
///
/// Cloning yields another handle to the same broker.
///
/// # Example
///
/// ```
/// use relay_durable::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.fail_next_sends(2);
/// assert!(broker.messages("durable-function-output").is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with [`TransportError::Unavailable`]
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` fetches fail with [`TransportError::Unavailable`]
    pub fn fail_next_fetches(&self, count: u32) {
        self.inner.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// All messages stored on `topic`
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed position of `group` on `topic`
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// Consumer for the topic and group in `config`
    pub fn consumer(&self, config: &BrokerConfig) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            offset_reset: config.offset_reset,
            position: Mutex::new(None),
        }
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u64, TransportError> {
        if Self::take_fault(&self.inner.failing_sends) {
            return Err(TransportError::Unavailable("injected send failure".to_string()));
        }

        let offset = {
            let mut state = self.inner.state.lock();
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as u64;
            log.push(BrokerMessage {
                topic: topic.to_string(),
                offset,
                payload,
                timestamp: Utc::now(),
            });
            offset
        };

        self.inner.appended.notify_waiters();
        debug!(topic, offset, "message stored");
        Ok(offset)
    }
}

/// Consumer handle of an [`InMemoryBroker`]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    offset_reset: OffsetReset,
    position: Mutex<Option<u64>>,
}

impl InMemoryConsumer {
    /// Next offset to read, resolving the starting point on first use
    fn position(&self, state: &BrokerState) -> u64 {
        let mut position = self.position.lock();
        *position.get_or_insert_with(|| {
            let key = (self.group_id.clone(), self.topic.clone());
            match (state.committed.get(&key), self.offset_reset) {
                (Some(committed), _) => *committed,
                (None, OffsetReset::Earliest) => 0,
                (None, OffsetReset::Latest) => {
                    state.topics.get(&self.topic).map_or(0, |log| log.len() as u64)
                }
            }
        })
    }

    fn take_ready(&self, max: usize) -> Vec<BrokerMessage> {
        let state = self.broker.inner.state.lock();
        let start = self.position(&state) as usize;
        let batch: Vec<BrokerMessage> = state
            .topics
            .get(&self.topic)
            .map(|log| log.iter().skip(start).take(max).cloned().collect())
            .unwrap_or_default();

        if let Some(last) = batch.last() {
            *self.position.lock() = Some(last.offset + 1);
        }
        batch
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<BrokerMessage>, TransportError> {
        if InMemoryBroker::take_fault(&self.broker.inner.failing_fetches) {
            return Err(TransportError::Unavailable("injected fetch failure".to_string()));
        }

        let appended = self.broker.inner.appended.notified();
        let batch = self.take_ready(max);
        if !batch.is_empty() {
            return Ok(batch);
        }

        if tokio::time::timeout(wait, appended).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.take_ready(max))
    }

    async fn commit(&self, next_offset: u64) -> Result<(), TransportError> {
        self.broker
            .inner
            .state
            .lock()
            .committed
            .insert((self.group_id.clone(), self.topic.clone()), next_offset);
        Ok(())
    }
}
