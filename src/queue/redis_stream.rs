//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! - Jobs are XADDed to a single stream and consumed through a consumer
//!   group, so each entry is delivered to exactly one worker at a time.
//! - Entries claimed by a crashed worker become redeliverable after the
//!   visibility timeout (XPENDING + XCLAIM).
//! - Failed deliveries are parked in a sorted set scored by their retry
//!   deadline and promoted back onto the stream with an incremented
//!   attempt counter.
//! - Jobs that exhaust their attempt budget are appended to a dead-letter
//!   stream and kept for operator inspection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};

use crate::config::RedisConfig;
use crate::domains::report::types::ReportJob;

use super::{DeadLetter, Delivery, QueueError, QueueResult, RetryPolicy, WorkQueue};

/// Entries claimed but unacknowledged for longer than this are considered
/// abandoned and redelivered to another consumer.
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 60_000;

/// How many parked retries to promote per poll.
const RETRY_PROMOTE_BATCH: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct ParkedRetry {
    job: ReportJob,
    attempt: u32,
}

pub struct RedisWorkQueue {
    client: redis::Client,
    stream_key: String,
    dlq_key: String,
    retry_key: String,
    group: String,
    consumer: String,
    policy: RetryPolicy,
    visibility_timeout_ms: u64,
}

impl RedisWorkQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: &RedisConfig, policy: RetryPolicy) -> QueueResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let queue = Self {
            client,
            stream_key: config.stream_key.clone(),
            dlq_key: config.dlq_key.clone(),
            retry_key: config.retry_key.clone(),
            group: config.consumer_group.clone(),
            consumer: format!("worker-{}", uuid::Uuid::new_v4()),
            policy,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
        };

        let mut conn = queue.connection().await?;

        // XGROUP CREATE with MKSTREAM creates the stream if it doesn't
        // exist. A BUSYGROUP reply means the group is already there.
        let created: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&queue.stream_key)
            .arg(&queue.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(QueueError::Command(format!("XGROUP CREATE failed: {}", e)));
            }
        }

        Ok(queue)
    }

    async fn connection(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    async fn add_entry(
        &self,
        conn: &mut MultiplexedConnection,
        job: &ReportJob,
        attempt: u32,
    ) -> QueueResult<()> {
        let payload =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("attempt")
            .arg(attempt.to_string())
            .arg("enqueued_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }

    /// Move parked retries whose deadline has passed back onto the stream.
    async fn promote_due_retries(&self, conn: &mut MultiplexedConnection) -> QueueResult<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.retry_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(RETRY_PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("ZRANGEBYSCORE failed: {}", e)))?;

        for member in due {
            let parked: ParkedRetry = serde_json::from_str(&member)
                .map_err(|e| QueueError::Deserialization(e.to_string()))?;
            self.add_entry(conn, &parked.job, parked.attempt).await?;

            let _: i64 = redis::cmd("ZREM")
                .arg(&self.retry_key)
                .arg(&member)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("ZREM failed: {}", e)))?;
        }

        Ok(())
    }

    /// Reclaim entries whose consumer went silent past the visibility
    /// timeout, making the crash-redelivery path look like a fresh claim.
    async fn claim_stale_pending(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> QueueResult<Option<Delivery>> {
        let pending: Vec<(String, String, u64, u64)> = match redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
        {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };

        let Some((entry_id, _, idle_ms, _)) = pending.into_iter().next() else {
            return Ok(None);
        };
        if idle_ms < self.visibility_timeout_ms {
            return Ok(None);
        }

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout_ms)
            .arg(&entry_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {}", e)))?;

        for entry in &claimed {
            if let Some(delivery) = self.parse_entry(entry) {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        block_ms: u64,
    ) -> QueueResult<Option<Delivery>> {
        // XREADGROUP with ">" delivers entries never seen by this group.
        let reply: Option<HashMap<String, Vec<redis::Value>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {}", e)))?;

        let Some(streams) = reply else {
            return Ok(None);
        };
        let entries = streams.get(&self.stream_key).cloned().unwrap_or_default();
        for entry in &entries {
            if let Some(delivery) = self.parse_entry(entry) {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// Parse a stream entry of the shape `[id, [field, value, ...]]`.
    fn parse_entry(&self, entry: &redis::Value) -> Option<Delivery> {
        let redis::Value::Bulk(parts) = entry else {
            return None;
        };
        let receipt = match parts.first() {
            Some(redis::Value::Data(data)) => String::from_utf8_lossy(data).to_string(),
            _ => return None,
        };
        let redis::Value::Bulk(field_values) = parts.get(1)? else {
            return None;
        };

        let mut fields = HashMap::new();
        for chunk in field_values.chunks(2) {
            if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                fields.insert(
                    String::from_utf8_lossy(key).to_string(),
                    String::from_utf8_lossy(value).to_string(),
                );
            }
        }

        let job: ReportJob = serde_json::from_str(fields.get("payload")?).ok()?;
        let attempt = fields
            .get("attempt")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1);

        Some(Delivery {
            receipt,
            job,
            attempt,
            max_attempts: self.policy.max_attempts,
        })
    }

    async fn acknowledge(
        &self,
        conn: &mut MultiplexedConnection,
        receipt: &str,
    ) -> QueueResult<()> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(receipt)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    /// Read retained dead letters, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.connection().await?;
        let entries: Vec<redis::Value> = redis::cmd("XRANGE")
            .arg(&self.dlq_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XRANGE failed: {}", e)))?;

        let mut letters = Vec::new();
        for entry in &entries {
            let redis::Value::Bulk(parts) = entry else {
                continue;
            };
            let Some(redis::Value::Bulk(field_values)) = parts.get(1) else {
                continue;
            };
            let mut fields = HashMap::new();
            for chunk in field_values.chunks(2) {
                if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                    fields.insert(
                        String::from_utf8_lossy(key).to_string(),
                        String::from_utf8_lossy(value).to_string(),
                    );
                }
            }
            let (Some(payload), Some(reason)) = (fields.get("payload"), fields.get("reason"))
            else {
                continue;
            };
            let Ok(job) = serde_json::from_str::<ReportJob>(payload) else {
                continue;
            };
            letters.push(DeadLetter {
                job,
                attempts: fields
                    .get("attempt")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                reason: reason.clone(),
                failed_at: fields
                    .get("failed_at")
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&chrono::Utc))
                    .unwrap_or_else(chrono::Utc::now),
            });
        }
        Ok(letters)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, job: &ReportJob) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        self.add_entry(&mut conn, job, 1).await
    }

    async fn next_delivery(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let mut conn = self.connection().await?;

        self.promote_due_retries(&mut conn).await?;

        if let Some(delivery) = self.claim_stale_pending(&mut conn).await? {
            return Ok(Some(delivery));
        }

        let block_ms = wait.as_millis().min(u128::from(u64::MAX)) as u64;
        self.read_new(&mut conn, block_ms.max(1)).await
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        self.acknowledge(&mut conn, &delivery.receipt).await
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        if delivery.is_final_attempt() {
            let payload = serde_json::to_string(&delivery.job)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let _: String = redis::cmd("XADD")
                .arg(&self.dlq_key)
                .arg("*")
                .arg("original_entry_id")
                .arg(&delivery.receipt)
                .arg("attempt")
                .arg(delivery.attempt.to_string())
                .arg("failed_at")
                .arg(chrono::Utc::now().to_rfc3339())
                .arg("reason")
                .arg(reason)
                .arg("payload")
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {}", e)))?;

            log::warn!(
                "Job for request {} dead-lettered after {} attempts: {}",
                delivery.job.request_id,
                delivery.attempt,
                reason
            );
        } else {
            let parked = ParkedRetry {
                job: delivery.job.clone(),
                attempt: delivery.attempt + 1,
            };
            let member = serde_json::to_string(&parked)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let due_at = chrono::Utc::now().timestamp_millis()
                + self.policy.delay_after(delivery.attempt).as_millis() as i64;

            let _: i64 = redis::cmd("ZADD")
                .arg(&self.retry_key)
                .arg(due_at)
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Command(format!("ZADD failed: {}", e)))?;
        }

        self.acknowledge(&mut conn, &delivery.receipt).await
    }
}
