//! Result delivery to live consumers
//!
//! Every subscriber owns a bounded FIFO queue. Publishing never blocks: when a
//! queue is full its oldest entry is dropped and the consumer's
//! `dropped_count` goes up, so one slow consumer cannot stall fusion or the
//! other consumers.
//!
//! Closed consumers (handle dropped or explicitly closed) are pruned on the
//! next publish.

use crate::utils::lock;
use serde::Serialize;
use sqal_common::types::FusionResult;
use sqal_common::SampleId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a single publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Consumers the result was queued for
    pub delivered: usize,
    /// Consumers that lost their oldest queued result to make room
    pub overflowed: usize,
    /// Closed consumers pruned during this publish
    pub removed: usize,
}

/// Point-in-time view of one consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerSnapshot {
    pub id: Uuid,
    pub queued: usize,
    pub dropped_count: u64,
    pub last_acked: Option<SampleId>,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<FusionResult>>,
    dropped_count: u64,
    last_acked: Option<SampleId>,
    closed: bool,
}

#[derive(Debug)]
struct ConsumerQueue {
    id: Uuid,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ConsumerQueue {
    /// Returns true when the oldest entry had to be dropped
    fn push(&self, result: Arc<FusionResult>) -> bool {
        let overflowed = {
            let mut state = lock(&self.state);
            let overflowed = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped_count += 1;
                true
            } else {
                false
            };
            state.items.push_back(result);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_waiters();
        // Wake a receiver that has not registered yet
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn snapshot(&self) -> ConsumerSnapshot {
        let state = lock(&self.state);
        ConsumerSnapshot {
            id: self.id,
            queued: state.items.len(),
            dropped_count: state.dropped_count,
            last_acked: state.last_acked.clone(),
        }
    }
}

/// Fan-out of fused results to every live consumer
#[derive(Debug)]
pub struct DeliveryChannel {
    capacity: usize,
    consumers: Mutex<HashMap<Uuid, Arc<ConsumerQueue>>>,
}

impl DeliveryChannel {
    /// Create a channel whose consumers each hold up to `capacity` results
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new consumer; it only sees results published from now on
    pub fn subscribe(&self) -> Consumer {
        let queue = Arc::new(ConsumerQueue {
            id: Uuid::new_v4(),
            capacity: self.capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        lock(&self.consumers).insert(queue.id, Arc::clone(&queue));
        debug!("Consumer {} subscribed (queue capacity {})", queue.id, self.capacity);
        Consumer { queue }
    }

    /// Remove a consumer immediately
    pub fn unsubscribe(&self, consumer: &Consumer) {
        consumer.close();
        if lock(&self.consumers).remove(&consumer.id()).is_some() {
            debug!("Consumer {} unsubscribed", consumer.id());
        }
    }

    /// Queue a result for every live consumer without blocking
    pub fn publish(&self, result: Arc<FusionResult>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut consumers = lock(&self.consumers);

        consumers.retain(|id, queue| {
            if queue.is_closed() {
                debug!("Pruning closed consumer {}", id);
                report.removed += 1;
                return false;
            }
            if queue.push(Arc::clone(&result)) {
                report.overflowed += 1;
                warn!(
                    "Consumer {} queue full; dropped oldest result to deliver {}",
                    id, result.sample_id
                );
            }
            report.delivered += 1;
            true
        });

        report
    }

    /// Number of registered consumers (including closed ones not yet pruned)
    pub fn consumer_count(&self) -> usize {
        lock(&self.consumers).len()
    }

    /// Live consumers, ordered by id
    pub fn consumers(&self) -> Vec<ConsumerSnapshot> {
        let queues: Vec<Arc<ConsumerQueue>> = lock(&self.consumers).values().cloned().collect();
        let mut snapshots: Vec<ConsumerSnapshot> = queues
            .iter()
            .filter(|queue| !queue.is_closed())
            .map(|queue| queue.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }
}

/// Receiving end of one consumer queue
///
/// Dropping the handle closes the queue; the channel prunes it on the next
/// publish.
#[derive(Debug)]
pub struct Consumer {
    queue: Arc<ConsumerQueue>,
}

impl Consumer {
    pub fn id(&self) -> Uuid {
        self.queue.id
    }

    /// Wait for the next result in FIFO order; `None` once closed and drained
    pub async fn recv(&self) -> Option<Arc<FusionResult>> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut state = lock(&self.queue.state);
                if let Some(result) = state.items.pop_front() {
                    return Some(result);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next result if one is queued
    pub fn try_recv(&self) -> Option<Arc<FusionResult>> {
        lock(&self.queue.state).items.pop_front()
    }

    /// Record the consumer's acknowledgement of a delivered sample
    pub fn ack(&self, sample_id: SampleId) {
        lock(&self.queue.state).last_acked = Some(sample_id);
    }

    pub fn last_acked(&self) -> Option<SampleId> {
        lock(&self.queue.state).last_acked.clone()
    }

    /// Results dropped from this queue on overflow since subscribing
    pub fn dropped_count(&self) -> u64 {
        lock(&self.queue.state).dropped_count
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.close();
    }
}
