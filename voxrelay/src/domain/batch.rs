use relay_envelope::WireError;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::job::JobId;
use super::stage::{PoolKey, Stage, StageInput, StageOutput, StageRequest};
use crate::{Error, Result};

/// Same-stage, same-tier requests submitted to one model call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub key: PoolKey,
    pub items: Vec<StageRequest>,
    pub formed_at: Instant,
}

impl Batch {
    /// Rejects empty batches and items that do not belong to `key`.
    pub fn new(key: PoolKey, items: Vec<StageRequest>) -> Result<Self> {
        if items.is_empty() {
            return Err(Error::validation("batch must contain at least one item"));
        }
        if let Some(stray) = items
            .iter()
            .find(|item| item.stage != key.stage || item.tier != key.tier)
        {
            return Err(Error::validation(format!(
                "item for job {} targets {}/{}, batch is {}",
                stray.job_id, stray.stage, stray.tier, key
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            key,
            items,
            formed_at: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn inputs(&self) -> Vec<StageInput> {
        self.items.iter().map(|item| item.input.clone()).collect()
    }

    /// Enqueue time of the oldest item.
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.items.iter().map(|item| item.enqueued_at).min()
    }
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub job_id: JobId,
    pub attempt: u32,
    pub result: std::result::Result<StageOutput, WireError>,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub key: PoolKey,
    pub worker_id: Option<u64>,
    pub latency: Duration,
    pub items: Vec<ItemResult>,
}

impl BatchResult {
    pub fn succeeded(
        batch: &Batch,
        worker_id: u64,
        latency: Duration,
        outputs: Vec<StageOutput>,
    ) -> Self {
        let items = batch
            .items
            .iter()
            .zip(outputs)
            .map(|(item, output)| ItemResult {
                job_id: item.job_id.clone(),
                attempt: item.attempt,
                result: Ok(output),
            })
            .collect();
        Self {
            batch_id: batch.id.clone(),
            key: batch.key.clone(),
            worker_id: Some(worker_id),
            latency,
            items,
        }
    }

    /// The whole batch failed with one error.
    pub fn failed(
        batch: &Batch,
        worker_id: Option<u64>,
        latency: Duration,
        error: WireError,
    ) -> Self {
        let items = batch
            .items
            .iter()
            .map(|item| ItemResult {
                job_id: item.job_id.clone(),
                attempt: item.attempt,
                result: Err(error.clone()),
            })
            .collect();
        Self {
            batch_id: batch.id.clone(),
            key: batch.key.clone(),
            worker_id,
            latency,
            items,
        }
    }

    pub fn is_success(&self) -> bool {
        self.items.iter().all(|item| item.result.is_ok())
    }

    pub fn into_completions(self) -> impl Iterator<Item = StageCompletion> {
        let stage = self.key.stage;
        self.items.into_iter().map(move |item| StageCompletion {
            job_id: item.job_id,
            stage,
            attempt: item.attempt,
            result: item.result,
        })
    }
}

/// Outcome of one stage attempt, reported back to the orchestrator.
#[derive(Debug, Clone)]
pub struct StageCompletion {
    pub job_id: JobId,
    pub stage: Stage,
    pub attempt: u32,
    pub result: std::result::Result<StageOutput, WireError>,
}
