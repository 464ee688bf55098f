use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::PoolEvent;
use super::model_pool::Pool;
use super::stats::PoolStats;
use crate::config::{PoolSettings, ScalingConfig};
use crate::domain::{Batch, BatchResult, JobId, PoolKey, StageCompletion, StageRequest};
use crate::model::ModelFactory;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Owns one [`Pool`] per (stage, tier) and their background loops.
pub struct WorkerPoolManager {
    pools: HashMap<PoolKey, Arc<Pool>>,
    scaling: ScalingConfig,
    events: broadcast::Sender<PoolEvent>,
    completion_tx: mpsc::UnboundedSender<StageCompletion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<StageCompletion>>>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPoolManager {
    pub fn new(
        settings: Vec<PoolSettings>,
        scaling: ScalingConfig,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let worker_ids = Arc::new(AtomicU64::new(1));

        let pools = settings
            .into_iter()
            .map(|settings| {
                let key = settings.key.clone();
                let pool = Pool::new(
                    settings,
                    factory.clone(),
                    events.clone(),
                    worker_ids.clone(),
                    cancellation_token.child_token(),
                );
                (key, pool)
            })
            .collect();

        Self {
            pools,
            scaling,
            events,
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            cancellation_token,
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Stage results from queued requests. Can be taken once.
    pub fn take_completions(&self) -> Option<mpsc::UnboundedReceiver<StageCompletion>> {
        self.completion_rx.lock().take()
    }

    /// Create minimum workers and start dispatch and scaling loops.
    pub async fn start(&self) {
        for pool in self.pools.values() {
            pool.warm_up().await;
        }

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for pool in self.pools.values() {
                join_set.spawn(pool.clone().dispatch_loop(self.completion_tx.clone()));
                if self.scaling.enabled {
                    join_set.spawn(pool.clone().scaler_loop(self.scaling.clone()));
                }
            }
        }
        info!(pools = self.pools.len(), autoscale = self.scaling.enabled, "Worker pools started");
    }

    pub fn pool_keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<PoolKey> = self.pools.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn has_pool(&self, key: &PoolKey) -> bool {
        self.pools.contains_key(key)
    }

    fn pool(&self, key: &PoolKey) -> Result<&Arc<Pool>> {
        self.pools
            .get(key)
            .ok_or_else(|| Error::not_found("pool", key.to_string()))
    }

    /// Queue a stage request. A full queue surfaces as [`Error::Overloaded`].
    pub fn enqueue(&self, request: StageRequest) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Overloaded("worker pools are shutting down".to_string()));
        }
        let pool = self.pool(&request.pool_key())?;
        pool.enqueue(request)?;
        Ok(())
    }

    /// Run `batch` on the pool for `key` and wait for its result.
    pub async fn submit_batch(&self, key: &PoolKey, batch: Batch) -> Result<BatchResult> {
        self.pool(key)?.submit_batch(batch).await
    }

    pub fn get_stats(&self, key: &PoolKey) -> Result<PoolStats> {
        Ok(self.pool(key)?.stats())
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pool_keys()
            .iter()
            .filter_map(|key| self.pools.get(key).map(|pool| pool.stats()))
            .collect()
    }

    /// Remove every queued request of a job. Returns how many were removed.
    pub fn cancel_job(&self, job_id: &JobId) -> usize {
        let removed: usize = self.pools.values().map(|pool| pool.cancel_job(job_id)).sum();
        if removed > 0 {
            debug!(job_id = %job_id, removed, "Removed queued stage requests");
        }
        removed
    }

    /// Manually resize a pool by one step. Returns whether the target changed.
    pub fn scale(&self, key: &PoolKey, grow: bool) -> Result<bool> {
        let pool = self.pool(key)?;
        Ok(if grow { pool.grow() } else { pool.shrink() })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop dispatching, let in-flight batches finish, then drop workers.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pools");
        self.cancellation_token.cancel();

        let tasks = self.tasks.lock().take();
        if let Some(mut join_set) = tasks {
            while join_set.join_next().await.is_some() {}
        }

        for pool in self.pools.values() {
            pool.drain().await;
        }
        info!("Worker pools stopped");
    }
}
