//! Typed JSON API carried in REQUEST/REPLY payloads.

use async_trait::async_trait;
use bytes::Bytes;
use relay_envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::server::RequestHandler;
use crate::delivery::{DeadLetter, TerminalEvent};
use crate::domain::{JobId, JobPayload, JobRequest, JobStatus, PoolKey, Priority, Stage, Tier};
use crate::pipeline::PipelineOrchestrator;
use crate::pool::{PoolStats, WorkerPoolManager};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Synchronous text translation: the reply carries the translations.
    Translate {
        text: String,
        #[serde(default)]
        source_language: Option<String>,
        target_languages: Vec<String>,
        #[serde(default)]
        priority: Option<Priority>,
        #[serde(default)]
        tier: Option<Tier>,
    },
    /// Asynchronous job; the terminal outcome arrives as an EVENT.
    SubmitJob { job: JobRequest },
    CancelJob { job_id: JobId },
    JobStatus { job_id: JobId },
    PoolStats {
        #[serde(default)]
        stage: Option<Stage>,
        #[serde(default)]
        tier: Option<Tier>,
    },
    ScalePool {
        stage: Stage,
        #[serde(default)]
        tier: Tier,
        grow: bool,
    },
    DeadLetters,
    RetryDeadLetter { id: u64 },
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub job_id: JobId,
    pub translations: BTreeMap<String, String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub changed: bool,
    pub stats: PoolStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub pools: usize,
    pub active_jobs: usize,
    pub dead_letters: usize,
}

/// Routes [`ApiRequest`]s to the orchestrator and the worker pools.
pub struct Gateway {
    orchestrator: Arc<PipelineOrchestrator>,
    pools: Arc<WorkerPoolManager>,
    sync_timeout: Duration,
}

impl Gateway {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        pools: Arc<WorkerPoolManager>,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            pools,
            sync_timeout,
        }
    }

    pub async fn dispatch(&self, request: ApiRequest) -> Result<Bytes> {
        match request {
            ApiRequest::Translate {
                text,
                source_language,
                target_languages,
                priority,
                tier,
            } => {
                let mut job = JobRequest::new(JobPayload::Translation {
                    text,
                    source_language,
                    target_languages,
                });
                job.priority = priority;
                job.tier = tier;
                let event = self.orchestrator.submit_and_wait(job, self.sync_timeout).await?;
                to_json(&translate_response(event)?)
            }
            ApiRequest::SubmitJob { job } => to_json(&self.orchestrator.submit(job).await?),
            ApiRequest::CancelJob { job_id } => to_json(&self.orchestrator.cancel(&job_id).await?),
            ApiRequest::JobStatus { job_id } => to_json(&self.orchestrator.status(&job_id).await?),
            ApiRequest::PoolStats { stage, tier } => {
                let stats: Vec<PoolStats> = self
                    .pools
                    .all_stats()
                    .into_iter()
                    .filter(|s| stage.is_none_or(|stage| s.stage == stage))
                    .filter(|s| tier.as_ref().is_none_or(|tier| &s.tier == tier))
                    .collect();
                to_json(&stats)
            }
            ApiRequest::ScalePool { stage, tier, grow } => {
                let key = PoolKey::new(stage, tier);
                let changed = self.pools.scale(&key, grow)?;
                to_json(&ScaleResponse {
                    changed,
                    stats: self.pools.get_stats(&key)?,
                })
            }
            ApiRequest::DeadLetters => {
                let letters: Vec<DeadLetter> = self.orchestrator.delivery().dead_letters();
                to_json(&letters)
            }
            ApiRequest::RetryDeadLetter { id } => {
                to_json(&self.orchestrator.delivery().retry_dead_letter(id).await?)
            }
            ApiRequest::Health => {
                let status = if self.pools.is_shutting_down() {
                    "shutting_down"
                } else {
                    "ok"
                };
                to_json(&HealthReport {
                    status: status.to_string(),
                    pools: self.pools.pool_keys().len(),
                    active_jobs: self.orchestrator.active_jobs(),
                    dead_letters: self.orchestrator.delivery().dead_letters().len(),
                })
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Gateway {
    async fn handle(&self, request: &Envelope) -> Result<Bytes> {
        let api_request: ApiRequest = serde_json::from_slice(&request.payload)
            .map_err(|e| Error::validation(format!("malformed request: {}", e)))?;
        debug!(correlation_id = %request.correlation_id, request = ?api_request, "Handling request");
        self.dispatch(api_request).await
    }
}

/// A finished synchronous job becomes either its translations or the typed
/// error it failed with.
fn translate_response(event: TerminalEvent) -> Result<TranslateResponse> {
    match event.terminal_status {
        JobStatus::Succeeded => Ok(TranslateResponse {
            job_id: event.job_id,
            translations: event.result.map(|r| r.translations).unwrap_or_default(),
            retry_count: event.retry_count,
        }),
        status => Err(event.error.map(Error::from_wire).unwrap_or_else(|| {
            Error::Other(format!("job {} ended {} without an error", event.job_id, status))
        })),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}
