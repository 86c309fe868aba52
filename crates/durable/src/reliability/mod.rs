//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded retry with exponential backoff and jitter

mod retry;

pub use retry::{RetryExhausted, RetryPolicy};
