//! A single (stage, tier) pool: its queue, workers, and dispatch loop.

use parking_lot::Mutex;
use relay_envelope::{ErrorCode, WireError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::autoscaler::{Autoscaler, ScaleDecision};
use super::events::{PoolEvent, RetireReason};
use super::stats::{PoolStats, StatsWindow};
use super::worker::Worker;
use crate::batch::BatchProcessor;
use crate::config::{PoolConfig, PoolSettings, ScalingConfig};
use crate::domain::{Batch, BatchResult, JobId, PoolKey, StageCompletion, StageRequest};
use crate::model::ModelFactory;
use crate::queue::{PriorityQueue, QueueFull};
use crate::{Error, Result};

/// Pause before the dispatch loop retries after a worker could not be created.
const WORKER_CREATE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PoolState {
    /// Front is the least recently used.
    idle: VecDeque<Worker>,
    /// Checked out, including slots whose worker is still being created.
    busy: usize,
    /// Idle + busy.
    live: usize,
    target: usize,
    closed: bool,
}

enum Checkout {
    Ready(Worker),
    Create,
    Wait,
}

pub struct Pool {
    key: PoolKey,
    config: PoolConfig,
    queue: Arc<PriorityQueue>,
    processor: BatchProcessor,
    factory: Arc<dyn ModelFactory>,
    state: Mutex<PoolState>,
    worker_freed: Notify,
    stats: Mutex<StatsWindow>,
    events: broadcast::Sender<PoolEvent>,
    worker_ids: Arc<AtomicU64>,
    executions: TaskTracker,
    cancel: CancellationToken,
}

impl Pool {
    pub(crate) fn new(
        settings: PoolSettings,
        factory: Arc<dyn ModelFactory>,
        events: broadcast::Sender<PoolEvent>,
        worker_ids: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(PriorityQueue::new(
            settings.key.clone(),
            settings.queue_capacity,
        ));
        let processor = BatchProcessor::new(queue.clone(), &settings.batch);
        Arc::new(Self {
            key: settings.key,
            state: Mutex::new(PoolState {
                target: settings.pool.min_workers,
                ..Default::default()
            }),
            config: settings.pool,
            queue,
            processor,
            factory,
            worker_freed: Notify::new(),
            stats: Mutex::new(StatsWindow::default()),
            events,
            worker_ids,
            executions: TaskTracker::new(),
            cancel,
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn enqueue(&self, request: StageRequest) -> std::result::Result<(), QueueFull> {
        self.queue.enqueue(request)
    }

    pub fn cancel_job(&self, job_id: &JobId) -> usize {
        self.queue.remove_job(job_id).len()
    }

    pub fn stats(&self) -> PoolStats {
        let (active, idle, size, target) = {
            let state = self.state.lock();
            (state.busy, state.idle.len(), state.live, state.target)
        };
        let window = self.stats.lock();
        PoolStats {
            stage: self.key.stage,
            tier: self.key.tier.clone(),
            queue_depth: self.queue.len(),
            active_workers: active,
            idle_workers: idle,
            size,
            target_size: target,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            avg_latency_ms: window.avg_latency_ms(),
            error_rate: window.error_rate(),
            batches_completed: window.completed,
            batches_failed: window.failed,
            workers_retired: window.retired,
        }
    }

    /// Create the minimum number of workers. Failures are logged and left to
    /// the dispatch loop to retry.
    pub(crate) async fn warm_up(self: &Arc<Self>) {
        while self.reserve_slot() {
            match self.create_worker().await {
                Ok(worker) => self.admit(worker),
                Err(e) => {
                    self.release_slot();
                    warn!(pool = %self.key, error = %e, "Failed to create worker during warm-up");
                    break;
                }
            }
        }
    }

    async fn create_worker(&self) -> Result<Worker> {
        let id = self.worker_ids.fetch_add(1, Ordering::Relaxed);
        let factory = self.factory.clone();
        let key = self.key.clone();
        let model = tokio::task::spawn_blocking(move || factory.create(&key))
            .await
            .map_err(|e| Error::Other(format!("model loader task failed: {}", e)))??;

        debug!(pool = %self.key, worker_id = id, "Worker spawned");
        let _ = self.events.send(PoolEvent::WorkerSpawned {
            pool: self.key.clone(),
            worker_id: id,
        });
        Ok(Worker::new(id, self.key.clone(), model))
    }

    fn reserve_slot(&self) -> bool {
        let mut state = self.state.lock();
        if !state.closed && state.live < state.target {
            state.live += 1;
            true
        } else {
            false
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }

    /// Put a freshly created worker into the idle set.
    fn admit(&self, worker: Worker) {
        let retired = {
            let mut state = self.state.lock();
            if state.closed || state.live > state.target {
                state.live -= 1;
                Some(worker)
            } else {
                state.idle.push_back(worker);
                None
            }
        };
        if let Some(worker) = retired {
            self.emit_retired(worker.id(), RetireReason::ScaleDown);
        }
        self.worker_freed.notify_waiters();
    }

    /// Create workers in the background until the pool reaches its target.
    fn replenish(self: &Arc<Self>) {
        while self.reserve_slot() {
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.create_worker().await {
                    Ok(worker) => pool.admit(worker),
                    Err(e) => {
                        pool.release_slot();
                        warn!(pool = %pool.key, error = %e, "Failed to create replacement worker");
                    }
                }
            });
        }
    }

    /// Check out the least recently used idle worker, creating one if the
    /// pool is below target, otherwise wait for one to be returned.
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> Result<Worker> {
        loop {
            let notified = self.worker_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::Cancelled(format!("pool {} is shut down", self.key)));
                }
                if let Some(worker) = state.idle.pop_front() {
                    state.busy += 1;
                    Checkout::Ready(worker)
                } else if state.live < state.target {
                    state.live += 1;
                    state.busy += 1;
                    Checkout::Create
                } else {
                    Checkout::Wait
                }
            };

            match next {
                Checkout::Ready(worker) => return Ok(worker),
                Checkout::Create => {
                    return match self.create_worker().await {
                        Ok(worker) => Ok(worker),
                        Err(e) => {
                            let mut state = self.state.lock();
                            state.live -= 1;
                            state.busy -= 1;
                            Err(e)
                        }
                    };
                }
                Checkout::Wait => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(Error::Cancelled(format!("pool {} is shutting down", self.key)));
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    /// Return a worker after a batch. Retires it instead when the pool is
    /// above target (pending scale-down) or closed.
    pub(crate) fn checkin(&self, worker: Worker) {
        let retired = {
            let mut state = self.state.lock();
            state.busy -= 1;
            if state.closed || state.live > state.target {
                state.live -= 1;
                let reason = if state.closed {
                    RetireReason::Shutdown
                } else {
                    RetireReason::ScaleDown
                };
                Some((worker, reason))
            } else {
                state.idle.push_back(worker);
                None
            }
        };
        if let Some((worker, reason)) = retired {
            debug!(pool = %self.key, worker_id = worker.id(), %reason, "Worker drained and retired");
            self.emit_retired(worker.id(), reason);
        }
        self.worker_freed.notify_waiters();
    }

    /// Forget a worker that did not come back from its batch, and replace it.
    fn retire_lost(self: &Arc<Self>, worker_id: u64, reason: RetireReason) {
        {
            let mut state = self.state.lock();
            state.busy -= 1;
            state.live -= 1;
        }
        self.stats.lock().retired += 1;
        self.emit_retired(worker_id, reason);
        self.replenish();
        self.worker_freed.notify_waiters();
    }

    fn emit_retired(&self, worker_id: u64, reason: RetireReason) {
        let _ = self.events.send(PoolEvent::WorkerRetired {
            pool: self.key.clone(),
            worker_id,
            reason,
        });
    }

    /// Raise the target by one, up to `max_workers`.
    pub fn grow(self: &Arc<Self>) -> bool {
        let target = {
            let mut state = self.state.lock();
            if state.closed || state.target >= self.config.max_workers {
                return false;
            }
            state.target += 1;
            state.target
        };
        info!(pool = %self.key, target, "Scaling up");
        let _ = self.events.send(PoolEvent::ScaledUp {
            pool: self.key.clone(),
            target,
        });
        self.replenish();
        true
    }

    /// Lower the target by one, down to `min_workers`. An idle worker is
    /// dropped at once; otherwise the next worker to finish its batch retires.
    pub fn shrink(&self) -> bool {
        let (target, dropped) = {
            let mut state = self.state.lock();
            if state.closed || state.target <= self.config.min_workers {
                return false;
            }
            state.target -= 1;
            let dropped = if state.live > state.target {
                let worker = state.idle.pop_front();
                if worker.is_some() {
                    state.live -= 1;
                }
                worker
            } else {
                None
            };
            (state.target, dropped)
        };
        info!(pool = %self.key, target, "Scaling down");
        if let Some(worker) = dropped {
            self.emit_retired(worker.id(), RetireReason::ScaleDown);
        }
        let _ = self.events.send(PoolEvent::ScaledDown {
            pool: self.key.clone(),
            target,
        });
        true
    }

    /// Run one batch on `worker` under the pool's batch timeout.
    pub(crate) async fn execute(self: &Arc<Self>, worker: Worker, batch: Batch) -> BatchResult {
        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        let worker_id = worker.id();
        let inputs = batch.inputs();
        let started = Instant::now();

        let call = tokio::task::spawn_blocking(move || {
            let mut worker = worker;
            let result = worker.run(&inputs);
            (worker, result)
        });

        let outcome = tokio::time::timeout(timeout, call).await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(Ok((worker, Ok(outputs)))) => {
                self.checkin(worker);
                BatchResult::succeeded(&batch, worker_id, latency, outputs)
            }
            Ok(Ok((worker, Err(e)))) => {
                warn!(pool = %self.key, batch_id = %batch.id, worker_id, error = %e, "Batch failed");
                self.checkin(worker);
                BatchResult::failed(&batch, Some(worker_id), latency, e.to_wire())
            }
            Ok(Err(join_err)) => {
                error!(pool = %self.key, batch_id = %batch.id, worker_id, error = %join_err, "Worker crashed during batch");
                self.retire_lost(worker_id, RetireReason::Crashed);
                BatchResult::failed(
                    &batch,
                    Some(worker_id),
                    latency,
                    WireError::new(ErrorCode::ModelFailure, "worker crashed during batch"),
                )
            }
            Err(_) => {
                // The blocking call keeps running on its thread; the worker is
                // dropped there when it returns and never reused.
                warn!(pool = %self.key, batch_id = %batch.id, worker_id, timeout_ms = self.config.batch_timeout_ms, "Batch timed out, retiring worker");
                self.retire_lost(worker_id, RetireReason::Timeout);
                BatchResult::failed(
                    &batch,
                    Some(worker_id),
                    latency,
                    WireError::new(
                        ErrorCode::Timeout,
                        format!("batch exceeded {}ms", self.config.batch_timeout_ms),
                    ),
                )
            }
        };

        self.record(&result, batch.len());
        result
    }

    fn record(&self, result: &BatchResult, size: usize) {
        let ok = result.is_success();
        self.stats.lock().record(result.latency, ok);

        let event = if ok {
            PoolEvent::BatchCompleted {
                pool: self.key.clone(),
                batch_id: result.batch_id.clone(),
                size,
                latency_ms: result.latency.as_millis() as u64,
            }
        } else {
            let code = result
                .items
                .iter()
                .find_map(|item| item.result.as_ref().err().map(|e| e.code))
                .unwrap_or(ErrorCode::Internal);
            PoolEvent::BatchFailed {
                pool: self.key.clone(),
                batch_id: result.batch_id.clone(),
                size,
                code,
            }
        };
        let _ = self.events.send(event);
    }

    /// Run a caller-formed batch directly, bypassing the queue.
    pub(crate) async fn submit_batch(self: &Arc<Self>, batch: Batch) -> Result<BatchResult> {
        if batch.key != self.key {
            return Err(Error::validation(format!(
                "batch for {} submitted to pool {}",
                batch.key, self.key
            )));
        }
        let worker = self.acquire(&self.cancel).await?;
        let pool = self.clone();
        // Tracked so shutdown drains it like a queued batch.
        self.executions
            .spawn(async move { pool.execute(worker, batch).await })
            .await
            .map_err(|e| Error::Other(format!("batch task failed: {}", e)))
    }

    /// Form batches from the queue and hand them to workers until cancelled.
    pub(crate) async fn dispatch_loop(
        self: Arc<Self>,
        completions: mpsc::UnboundedSender<StageCompletion>,
    ) {
        info!(pool = %self.key, "Dispatch loop started");
        let cancel = self.cancel.clone();

        loop {
            if !self.processor.wait_ready(&cancel).await {
                break;
            }

            let worker = match self.acquire(&cancel).await {
                Ok(worker) => worker,
                Err(Error::Cancelled(_)) => break,
                Err(e) => {
                    warn!(pool = %self.key, error = %e, "No worker available");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(WORKER_CREATE_BACKOFF) => continue,
                    }
                }
            };

            let items = self.processor.take();
            if items.is_empty() {
                // Everything was cancelled while we waited for a worker.
                self.checkin(worker);
                continue;
            }

            let batch = match Batch::new(self.key.clone(), items) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(pool = %self.key, error = %e, "Dropping malformed batch");
                    self.checkin(worker);
                    continue;
                }
            };

            debug!(pool = %self.key, batch_id = %batch.id, size = batch.len(), worker_id = worker.id(), "Dispatching batch");
            let pool = self.clone();
            let completions = completions.clone();
            self.executions.spawn(async move {
                let result = pool.execute(worker, batch).await;
                for completion in result.into_completions() {
                    if completions.send(completion).is_err() {
                        debug!("Completion receiver dropped");
                        break;
                    }
                }
            });
        }

        info!(pool = %self.key, "Dispatch loop stopped");
    }

    /// Sample queue depth and resize within [min, max] until cancelled.
    pub(crate) async fn scaler_loop(self: Arc<Self>, config: ScalingConfig) {
        let mut autoscaler = Autoscaler::new(config.clone());
        let mut ticker =
            tokio::time::interval(Duration::from_millis(config.sample_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let depth = self.queue.len();
            let target = self.state.lock().target;
            match autoscaler.observe(
                depth,
                target,
                self.config.min_workers,
                self.config.max_workers,
            ) {
                ScaleDecision::Grow => {
                    self.grow();
                }
                ScaleDecision::Shrink => {
                    self.shrink();
                }
                ScaleDecision::Hold => {}
            }
        }
    }

    /// Wait for in-flight batches, then drop all workers.
    pub(crate) async fn drain(&self) {
        self.executions.close();
        self.executions.wait().await;

        let idle: Vec<Worker> = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle: Vec<Worker> = state.idle.drain(..).collect();
            state.live -= idle.len();
            idle
        };
        for worker in &idle {
            self.emit_retired(worker.id(), RetireReason::Shutdown);
        }
        drop(idle);
        self.worker_freed.notify_waiters();

        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(pool = %self.key, dropped, "Discarded queued requests at shutdown");
        }
    }
}
