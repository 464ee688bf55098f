//! Batch formation on top of a [`PriorityQueue`].
//!
//! A batch is ready when the queue holds `max_batch_size` items, or when the
//! oldest queued item has waited `max_wait`. Until then the processor sleeps on
//! whichever comes first: the next enqueue or the wait ceiling.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BatchConfig;
use crate::domain::StageRequest;
use crate::queue::PriorityQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Empty,
    /// Enough items for a full batch.
    Full,
    /// Under-filled, but the oldest item reached the wait ceiling.
    Expired,
    /// Under-filled; becomes `Expired` at the given instant.
    Waiting(Instant),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Full | Readiness::Expired)
    }
}

pub struct BatchProcessor {
    queue: Arc<PriorityQueue>,
    max_batch_size: usize,
    max_wait: Duration,
}

impl BatchProcessor {
    pub fn new(queue: Arc<PriorityQueue>, config: &BatchConfig) -> Self {
        Self {
            queue,
            max_batch_size: config.max_batch_size.max(1),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn readiness(&self, now: Instant) -> Readiness {
        let len = self.queue.len();
        if len == 0 {
            return Readiness::Empty;
        }
        if len >= self.max_batch_size {
            return Readiness::Full;
        }
        match self.queue.oldest_enqueued_at() {
            Some(oldest) => {
                let deadline = oldest + self.max_wait;
                if now >= deadline {
                    Readiness::Expired
                } else {
                    Readiness::Waiting(deadline)
                }
            }
            None => Readiness::Empty,
        }
    }

    /// Suspend until a batch is ready. Returns `false` if cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.readiness(Instant::now()) {
                Readiness::Full | Readiness::Expired => return true,
                Readiness::Empty => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = self.queue.notified() => {}
                    }
                }
                Readiness::Waiting(deadline) => {
                    // Timer first: a partial batch goes out at the ceiling.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep_until(deadline) => return true,
                        _ = self.queue.notified() => {}
                    }
                }
            }
        }
    }

    /// Take the next batch's items (possibly fewer than the maximum).
    pub fn take(&self) -> Vec<StageRequest> {
        self.queue.dequeue_batch(self.max_batch_size)
    }

    /// Wait for readiness, then take. `None` when cancelled.
    pub async fn next_batch(&self, cancel: &CancellationToken) -> Option<Vec<StageRequest>> {
        loop {
            if !self.wait_ready(cancel).await {
                return None;
            }
            let items = self.take();
            if !items.is_empty() {
                return Some(items);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, PoolKey, Priority, Stage, StageInput, Tier};

    fn queue(capacity: usize) -> Arc<PriorityQueue> {
        Arc::new(PriorityQueue::new(
            PoolKey::new(Stage::Translate, Tier::default()),
            capacity,
        ))
    }

    fn item(job: &str) -> StageRequest {
        StageRequest::new(
            JobId::from(job),
            Tier::default(),
            StageInput::Translate {
                text: job.into(),
                source_language: None,
                target_languages: vec!["it".into()],
            },
            Priority::Normal,
            1,
        )
    }

    fn config(max_batch_size: usize, max_wait_ms: u64) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            max_wait_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatches_immediately() {
        let q = queue(16);
        let processor = BatchProcessor::new(q.clone(), &config(3, 50));
        for i in 0..4 {
            q.enqueue(item(&format!("j{}", i))).unwrap();
        }
        let start = Instant::now();
        let batch = processor.next_batch(&CancellationToken::new()).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(Instant::now(), start);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_at_wait_ceiling() {
        let q = queue(16);
        let processor = BatchProcessor::new(q.clone(), &config(8, 50));
        q.enqueue(item("a")).unwrap();
        q.enqueue(item("b")).unwrap();

        let start = Instant::now();
        let batch = processor.next_batch(&CancellationToken::new()).await.unwrap();
        let waited = Instant::now() - start;

        assert_eq!(batch.len(), 2);
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_counts_from_oldest_item() {
        let q = queue(16);
        let processor = BatchProcessor::new(q.clone(), &config(8, 50));
        q.enqueue(item("first")).unwrap();
        let start = Instant::now();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                q.enqueue(item("second")).unwrap();
            })
        };

        let batch = processor.next_batch(&CancellationToken::new()).await.unwrap();
        producer.await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(Instant::now() - start, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrival_completes_batch_before_ceiling() {
        let q = queue(16);
        let processor = BatchProcessor::new(q.clone(), &config(2, 1_000));
        q.enqueue(item("a")).unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                q.enqueue(item("b")).unwrap();
            })
        };

        let start = Instant::now();
        let batch = processor.next_batch(&CancellationToken::new()).await.unwrap();
        producer.await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(Instant::now() - start, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_one_is_per_item() {
        let q = queue(16);
        let processor = BatchProcessor::new(q.clone(), &config(1, 500));
        q.enqueue(item("a")).unwrap();
        q.enqueue(item("b")).unwrap();
        assert_eq!(processor.readiness(Instant::now()), Readiness::Full);

        let start = Instant::now();
        let first = processor.next_batch(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job_id.as_str(), "a");
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_idle() {
        let q = queue(4);
        let processor = BatchProcessor::new(q, &config(4, 50));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });
        assert!(processor.next_batch(&cancel).await.is_none());
    }
}
