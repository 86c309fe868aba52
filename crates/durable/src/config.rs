//! Configuration loaded from the environment
//!
//! Every setting has a default; `from_env` only overrides what is set.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatcherConfig;
use crate::engine::ExecutorConfig;
use crate::reliability::RetryPolicy;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Where a consumer group starts when it has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    /// Start at the oldest retained message
    #[default]
    Earliest,

    /// Start after the newest message
    Latest,
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(format!("expected 'earliest' or 'latest', got '{other}'")),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
        }
    }
}

/// Broker connection and topic settings shared by publisher and consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Comma-separated bootstrap addresses
    pub broker_addresses: String,

    /// Topic results are published to and consumed from
    pub topic: String,

    /// Consumer group id
    pub group_id: String,

    /// Starting point for a group without a committed offset
    pub offset_reset: OffsetReset,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_addresses: "localhost:9092".to_string(),
            topic: "durable-function-output".to_string(),
            group_id: "my-group".to_string(),
            offset_reset: OffsetReset::Earliest,
        }
    }
}

impl BrokerConfig {
    /// Load from `BROKER_ADDRESSES`, `BROKER_TOPIC`, `CONSUMER_GROUP_ID` and
    /// `CONSUMER_OFFSET_RESET`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            broker_addresses: lookup("BROKER_ADDRESSES").unwrap_or(defaults.broker_addresses),
            topic: lookup("BROKER_TOPIC").unwrap_or(defaults.topic),
            group_id: lookup("CONSUMER_GROUP_ID").unwrap_or(defaults.group_id),
            offset_reset: parse_var(&lookup, "CONSUMER_OFFSET_RESET", defaults.offset_reset)?,
        })
    }

    pub fn with_broker_addresses(mut self, addresses: impl Into<String>) -> Self {
        self.broker_addresses = addresses.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }
}

/// Engine settings: executor, dispatcher and publish retries
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub executor: ExecutorConfig,
    pub dispatcher: DispatcherConfig,
    pub publish_retry: RetryPolicy,
}

impl RuntimeConfig {
    /// Load overrides from `RELAY_MAX_CONCURRENT_ACTIVITIES`,
    /// `RELAY_MAX_CONFLICT_RETRIES`, `RELAY_PUBLISH_MAX_ATTEMPTS` and
    /// `RELAY_PUBLISH_INITIAL_BACKOFF_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrency = parse_var(
            &lookup,
            "RELAY_MAX_CONCURRENT_ACTIVITIES",
            defaults.dispatcher.max_concurrency,
        )?;
        let max_conflict_retries = parse_var(
            &lookup,
            "RELAY_MAX_CONFLICT_RETRIES",
            defaults.executor.max_conflict_retries,
        )?;
        let max_attempts = parse_var(
            &lookup,
            "RELAY_PUBLISH_MAX_ATTEMPTS",
            defaults.publish_retry.max_attempts,
        )?;
        let initial_backoff_ms = parse_var(
            &lookup,
            "RELAY_PUBLISH_INITIAL_BACKOFF_MS",
            defaults.publish_retry.initial_interval.as_millis() as u64,
        )?;

        Ok(Self {
            executor: defaults
                .executor
                .with_max_conflict_retries(max_conflict_retries),
            dispatcher: defaults.dispatcher.with_max_concurrency(max_concurrency),
            publish_retry: defaults
                .publish_retry
                .with_max_attempts(max_attempts)
                .with_initial_interval(Duration::from_millis(initial_backoff_ms)),
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}
