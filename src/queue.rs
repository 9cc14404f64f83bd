//! Work queue seam and the in-process implementation.
//!
//! Contract: at-least-once delivery. A consumed message stays in flight
//! until acked; unacked messages are redelivered after the in-flight
//! timeout, and messages redelivered too many times land in the
//! dead-letter buffer. `nack(requeue = true)` re-enqueues with
//! `attempt + 1` after a short delay so retries do not spin.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::model::QueueMessage;

/// Upper bound on how long a consumer sleeps between wakeup checks.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A consumed message plus the tag needed to ack or nack it.
#[derive(Debug)]
pub struct Delivery {
    pub message: QueueMessage,
    tag: u64,
}

impl Delivery {
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// The queue seam the worker and reconciler run against.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a message naming `ticket_id`.
    async fn enqueue(&self, ticket_id: Uuid, attempt: u32) -> Result<(), QueueError>;

    /// Wait for the next message. Suspends until one is available or the
    /// queue is closed and drained.
    async fn consume(&self) -> Result<Delivery, QueueError>;

    /// Confirm the delivery; the message will not be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reject the delivery. With `requeue` the message goes back on the
    /// queue with `attempt + 1`; without, it is dead-lettered.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
}

struct ReadyEntry {
    message: QueueMessage,
    redeliveries: u32,
    not_before: Option<Instant>,
}

struct InFlightEntry {
    message: QueueMessage,
    redeliveries: u32,
    deadline: Instant,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<ReadyEntry>,
    in_flight: HashMap<u64, InFlightEntry>,
    dead: Vec<QueueMessage>,
    next_tag: u64,
    closed: bool,
}

/// Queue depth snapshot, for tests and the demo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub dead_letter: usize,
}

/// In-process queue backed by a mutex-guarded deque.
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    config: QueueConfig,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            config,
        }
    }

    /// Stop accepting messages. Consumers drain what remains and then get
    /// `QueueError::Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn stats(&self) -> QueueStats {
        let mut inner = self.inner.lock().await;
        self.expire_locked(&mut inner, Instant::now());
        QueueStats {
            ready: inner.ready.len(),
            in_flight: inner.in_flight.len(),
            dead_letter: inner.dead.len(),
        }
    }

    pub async fn dead_letters(&self) -> Vec<QueueMessage> {
        let mut inner = self.inner.lock().await;
        self.expire_locked(&mut inner, Instant::now());
        inner.dead.clone()
    }

    /// Move expired in-flight entries back to ready (or dead-letter them
    /// when the redelivery cap is hit). Caller holds the lock.
    fn expire_locked(&self, inner: &mut QueueInner, now: Instant) {
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some(entry) = inner.in_flight.remove(&tag) {
                let redeliveries = entry.redeliveries + 1;
                if redeliveries > self.config.max_redeliveries {
                    tracing::warn!(
                        ticket_id = %entry.message.ticket_id,
                        redeliveries,
                        "message exceeded redelivery cap, dead-lettering"
                    );
                    inner.dead.push(entry.message);
                } else {
                    tracing::debug!(
                        ticket_id = %entry.message.ticket_id,
                        redeliveries,
                        "in-flight timeout, redelivering"
                    );
                    inner.ready.push_front(ReadyEntry {
                        message: entry.message,
                        redeliveries,
                        not_before: None,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, ticket_id: Uuid, attempt: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.ready.push_back(ReadyEntry {
            message: QueueMessage::new(ticket_id, attempt),
            redeliveries: 0,
            not_before: None,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self) -> Result<Delivery, QueueError> {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                self.expire_locked(&mut inner, now);

                let eligible = inner
                    .ready
                    .iter()
                    .position(|e| e.not_before.is_none_or(|t| t <= now));
                if let Some(pos) = eligible {
                    // remove(pos) is always Some here
                    if let Some(entry) = inner.ready.remove(pos) {
                        let tag = inner.next_tag;
                        inner.next_tag += 1;
                        inner.in_flight.insert(
                            tag,
                            InFlightEntry {
                                message: entry.message.clone(),
                                redeliveries: entry.redeliveries,
                                deadline: now + self.config.in_flight_timeout(),
                            },
                        );
                        return Ok(Delivery {
                            message: entry.message,
                            tag,
                        });
                    }
                }

                if inner.closed && inner.ready.is_empty() && inner.in_flight.is_empty() {
                    return Err(QueueError::Closed);
                }

                // Sleep until the nearest deadline, capped so enqueues and
                // closes are noticed promptly.
                let nearest = inner
                    .ready
                    .iter()
                    .filter_map(|e| e.not_before)
                    .chain(inner.in_flight.values().map(|e| e.deadline))
                    .min();
                match nearest {
                    Some(t) => t.saturating_duration_since(now).min(POLL_INTERVAL),
                    None => POLL_INTERVAL,
                }
            };

            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .in_flight
            .remove(&delivery.tag)
            .ok_or(QueueError::UnknownDelivery(delivery.tag))?;

        if requeue {
            let redeliveries = entry.redeliveries + 1;
            if redeliveries > self.config.max_redeliveries {
                tracing::warn!(
                    ticket_id = %entry.message.ticket_id,
                    redeliveries,
                    "nacked message exceeded redelivery cap, dead-lettering"
                );
                inner.dead.push(entry.message);
            } else {
                inner.ready.push_back(ReadyEntry {
                    message: QueueMessage {
                        ticket_id: entry.message.ticket_id,
                        attempt: entry.message.attempt + 1,
                        enqueued_at: Utc::now(),
                    },
                    redeliveries,
                    not_before: Some(Instant::now() + self.config.retry_delay()),
                });
            }
        } else {
            inner.dead.push(entry.message);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            in_flight_timeout_secs: 1,
            max_redeliveries: 2,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_enqueue_consume_ack() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();

        let delivery = queue.consume().await.unwrap();
        assert_eq!(delivery.message.ticket_id, id);
        assert_eq!(delivery.message.attempt, 1);

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_bumps_attempt() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();

        let delivery = queue.consume().await.unwrap();
        queue.nack(&delivery, true).await.unwrap();

        let redelivered = queue.consume().await.unwrap();
        assert_eq!(redelivered.message.ticket_id, id);
        assert_eq!(redelivered.message.attempt, 2);
        queue.ack(&redelivered).await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();

        let delivery = queue.consume().await.unwrap();
        queue.nack(&delivery, false).await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].ticket_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_times_out_and_redelivers() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();

        let first = queue.consume().await.unwrap();
        // never acked; advance past the in-flight timeout
        tokio::time::advance(Duration::from_secs(2)).await;

        let second = queue.consume().await.unwrap();
        assert_eq!(second.message.ticket_id, id);
        // redelivery keeps the original attempt stamp
        assert_eq!(second.message.attempt, 1);

        // the stale tag is gone
        assert!(queue.ack(&first).await.is_err());
        queue.ack(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_cap_dead_letters() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();

        // max_redeliveries = 2: deliveries 1..=3 succeed, then dead-letter
        for _ in 0..3 {
            let delivery = queue.consume().await.unwrap();
            assert_eq!(delivery.message.ticket_id, id);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = queue.stats().await;
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_errors() {
        let queue = InMemoryQueue::new(fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, 1).await.unwrap();
        queue.close().await;

        // already-queued message still drains
        let delivery = queue.consume().await.unwrap();
        queue.ack(&delivery).await.unwrap();

        assert!(matches!(queue.consume().await, Err(QueueError::Closed)));
        assert!(matches!(queue.enqueue(id, 1).await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_split_messages() {
        use std::sync::Arc;

        let queue = Arc::new(InMemoryQueue::new(fast_config()));
        for _ in 0..4 {
            queue.enqueue(Uuid::new_v4(), 1).await.unwrap();
        }

        let a = {
            let q = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    let d = q.consume().await.unwrap();
                    seen.push(d.message.ticket_id);
                    q.ack(&d).await.unwrap();
                }
                seen
            })
        };
        let b = {
            let q = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    let d = q.consume().await.unwrap();
                    seen.push(d.message.ticket_id);
                    q.ack(&d).await.unwrap();
                }
                seen
            })
        };

        let mut all = a.await.unwrap();
        all.extend(b.await.unwrap());
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4);
    }
}
