//! In-process work queue with the same at-least-once contract as the Redis
//! adapter. Used by tests and single-process local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domains::report::types::ReportJob;

use super::{DeadLetter, Delivery, QueueError, QueueResult, RetryPolicy, WorkQueue};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(ReportJob, u32)>,
    delayed: Vec<(Instant, ReportJob, u32)>,
    in_flight: HashMap<u64, (ReportJob, u32)>,
    dead: Vec<DeadLetter>,
    next_receipt: u64,
}

pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    policy: RetryPolicy,
}

impl InMemoryWorkQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            policy,
        }
    }

    /// Jobs retained after exhausting their retry budget.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Ready + delayed + in-flight job count.
    pub async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }

    fn promote_due(state: &mut QueueState, now: Instant) {
        let mut index = 0;
        while index < state.delayed.len() {
            if state.delayed[index].0 <= now {
                let (_, job, attempt) = state.delayed.remove(index);
                state.ready.push_back((job, attempt));
            } else {
                index += 1;
            }
        }
    }

    async fn try_take(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        Self::promote_due(&mut state, Instant::now());

        let (job, attempt) = state.ready.pop_front()?;
        state.next_receipt += 1;
        let receipt = state.next_receipt;
        state.in_flight.insert(receipt, (job.clone(), attempt));

        Some(Delivery {
            receipt: receipt.to_string(),
            job,
            attempt,
            max_attempts: self.policy.max_attempts,
        })
    }

    fn parse_receipt(delivery: &Delivery) -> QueueResult<u64> {
        delivery
            .receipt
            .parse::<u64>()
            .map_err(|_| QueueError::Deserialization(format!("bad receipt {}", delivery.receipt)))
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job: &ReportJob) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state.ready.push_back((job.clone(), 1));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_take().await {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake up early for notifications, but poll the delayed set at
            // a bounded interval so parked retries are promoted on time.
            let nap = (deadline - now).min(Duration::from_millis(50));
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let receipt = Self::parse_receipt(delivery)?;
        self.state.lock().await.in_flight.remove(&receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let receipt = Self::parse_receipt(delivery)?;
        let mut state = self.state.lock().await;
        let Some((job, attempt)) = state.in_flight.remove(&receipt) else {
            return Ok(());
        };

        if attempt >= self.policy.max_attempts {
            state.dead.push(DeadLetter {
                job,
                attempts: attempt,
                reason: reason.to_string(),
                failed_at: chrono::Utc::now(),
            });
        } else {
            let due_at = Instant::now() + self.policy.delay_after(attempt);
            state.delayed.push((due_at, job, attempt + 1));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job() -> ReportJob {
        ReportJob {
            request_id: Uuid::new_v4(),
            class_id: "class-1".to_string(),
            report_kind: "tabular-pdf".to_string(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_deliver() {
        let queue = InMemoryWorkQueue::new(fast_policy());
        let job = job();
        queue.enqueue(&job).await.unwrap();

        let delivery = queue
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("delivery");
        assert_eq!(delivery.job, job);
        assert_eq!(delivery.attempt, 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let queue = InMemoryWorkQueue::new(fast_policy());
        let delivery = queue.next_delivery(Duration::from_millis(20)).await.unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_backoff_then_dead_letters() {
        let queue = InMemoryWorkQueue::new(fast_policy());
        queue.enqueue(&job()).await.unwrap();

        for expected_attempt in 1..=3 {
            let delivery = queue
                .next_delivery(Duration::from_millis(500))
                .await
                .unwrap()
                .expect("delivery");
            assert_eq!(delivery.attempt, expected_attempt);
            queue.nack(&delivery, "boom").await.unwrap();
        }

        // Attempt budget exhausted, nothing left to deliver.
        let delivery = queue.next_delivery(Duration::from_millis(50)).await.unwrap();
        assert!(delivery.is_none());

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_in_flight_is_not_redelivered() {
        let queue = InMemoryWorkQueue::new(fast_policy());
        queue.enqueue(&job()).await.unwrap();

        let first = queue
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("delivery");
        let second = queue.next_delivery(Duration::from_millis(20)).await.unwrap();
        assert!(second.is_none(), "in-flight job must not be double-delivered");

        queue.ack(&first).await.unwrap();
    }
}
