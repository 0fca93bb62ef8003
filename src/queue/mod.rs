pub mod memory;
pub mod redis_stream;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domains::report::types::ReportJob;

pub use memory::InMemoryWorkQueue;
pub use redis_stream::RedisWorkQueue;

/// Work queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Retry settings applied by the queue to failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total delivery attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (doubled per attempt).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before redelivering after the given failed attempt:
    /// base, 2x base, 4x base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base_delay.saturating_mul(factor)
    }
}

/// One delivery of a job to a consumer. The receipt ties `ack`/`nack` back
/// to the underlying queue entry.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub job: ReportJob,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job retained after its retry budget was exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: ReportJob,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable, at-least-once delivery channel carrying generation jobs between
/// the request path and worker processes.
///
/// A delivery handed to one consumer is not concurrently handed to another,
/// unless it is redelivered after the visibility timeout expires. Consumers
/// must therefore be idempotent.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a job for asynchronous processing.
    async fn enqueue(&self, job: &ReportJob) -> QueueResult<()>;

    /// Pull the next available delivery, waiting up to `wait` for one.
    /// Returns `None` when the queue stayed empty for the whole window.
    async fn next_delivery(&self, wait: Duration) -> QueueResult<Option<Delivery>>;

    /// Mark a delivery as successfully processed.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Mark a delivery as failed. The queue redelivers it with exponential
    /// backoff until the attempt cap, then moves it to the dead-letter
    /// store.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn test_final_attempt_detection() {
        let delivery = Delivery {
            receipt: "1".to_string(),
            job: ReportJob {
                request_id: uuid::Uuid::new_v4(),
                class_id: "c".to_string(),
                report_kind: "tabular-pdf".to_string(),
            },
            attempt: 3,
            max_attempts: 3,
        };
        assert!(delivery.is_final_attempt());
    }
}
