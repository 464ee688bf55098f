//! Bounded priority queue of stage requests for one pool.
//!
//! Ordering is strict priority (URGENT first), then FIFO by arrival within a
//! priority. There is no weighted fairness: a sustained stream of URGENT work
//! starves lower priorities, so callers needing fairness must rate-limit
//! URGENT submissions themselves.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::{JobId, PoolKey, Priority, StageRequest};

#[derive(Debug, Clone, Error)]
#[error("queue for {key} is full ({capacity} items)")]
pub struct QueueFull {
    pub key: PoolKey,
    pub capacity: usize,
}

impl From<QueueFull> for crate::Error {
    fn from(err: QueueFull) -> Self {
        crate::Error::Overloaded(err.to_string())
    }
}

type OrderKey = (Reverse<Priority>, u64);

#[derive(Default)]
struct QueueInner {
    items: BTreeMap<OrderKey, StageRequest>,
    /// Arrival sequence to enqueue time, for the oldest-waiting check.
    arrivals: BTreeMap<u64, Instant>,
    next_seq: u64,
}

pub struct PriorityQueue {
    key: PoolKey,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new(key: PoolKey, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add an item without blocking. Fails with [`QueueFull`] at capacity.
    pub fn enqueue(&self, mut item: StageRequest) -> Result<(), QueueFull> {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() >= self.capacity {
                return Err(QueueFull {
                    key: self.key.clone(),
                    capacity: self.capacity,
                });
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            item.enqueued_at = Instant::now();
            trace!(pool = %self.key, job_id = %item.job_id, priority = %item.priority, seq, "enqueued");
            inner.arrivals.insert(seq, item.enqueued_at);
            inner.items.insert((Reverse(item.priority), seq), item);
        }
        // A stored permit covers an enqueue that lands before the consumer waits.
        self.notify.notify_one();
        Ok(())
    }

    /// Remove up to `max_items` items in priority order.
    pub fn dequeue_batch(&self, max_items: usize) -> Vec<StageRequest> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(max_items.min(inner.items.len()));
        while out.len() < max_items {
            let Some(((_, seq), item)) = inner.items.pop_first() else {
                break;
            };
            inner.arrivals.remove(&seq);
            out.push(item);
        }
        out
    }

    /// Remove every queued request of `job_id`.
    pub fn remove_job(&self, job_id: &JobId) -> Vec<StageRequest> {
        let mut inner = self.inner.lock();
        let keys: Vec<OrderKey> = inner
            .items
            .iter()
            .filter(|(_, item)| &item.job_id == job_id)
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = inner.items.remove(&key) {
                inner.arrivals.remove(&key.1);
                removed.push(item);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Enqueue time of the item that has waited longest, regardless of priority.
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.inner
            .lock()
            .arrivals
            .first_key_value()
            .map(|(_, at)| *at)
    }

    /// Resolves after the next enqueue (or immediately if one is pending).
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Drop everything still queued. Used on shutdown.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        inner.arrivals.clear();
        n
    }
}
