//! Per-job stage state machine on top of the worker pools.
//!
//! The orchestrator owns every accepted job. It validates inline, enqueues
//! one stage request at a time, advances on completions, retries failed
//! stages with backoff and finishes each job exactly once. Terminal events
//! are broadcast and handed to the delivery service; the pipeline record is
//! released once every sink has the event.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_envelope::{ErrorCode, WireError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::events::JobEvent;
use super::record::{JobSnapshot, PipelineRecord};
use super::retry::RetryPolicy;
use super::store::PipelineStore;
use crate::config::OrchestratorConfig;
use crate::delivery::{DeliveryService, TerminalEvent};
use crate::domain::{
    Job, JobId, JobRequest, JobStatus, PoolKey, Stage, StageCompletion, StageOutput, StagePlan,
    StageRequest,
};
use crate::pool::WorkerPoolManager;
use crate::{Error, Result};

type RecordHandle = Arc<AsyncMutex<PipelineRecord>>;

/// What [`PipelineOrchestrator::recover`] picked up from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Unfinished jobs whose current stage was enqueued again.
    pub resumed: usize,
    /// Finished jobs whose terminal event was sent again.
    pub redelivered: usize,
}

/// Bounded cache of snapshots for released jobs.
struct FinishedJobs {
    order: VecDeque<JobId>,
    snapshots: HashMap<JobId, JobSnapshot>,
    capacity: usize,
}

impl FinishedJobs {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            snapshots: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, snapshot: JobSnapshot) {
        let job_id = snapshot.job_id.clone();
        if self.snapshots.insert(job_id.clone(), snapshot).is_none() {
            self.order.push_back(job_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.snapshots.remove(&oldest);
            }
        }
    }

    fn get(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.snapshots.get(job_id).cloned()
    }
}

pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
    pools: Arc<WorkerPoolManager>,
    store: Arc<dyn PipelineStore>,
    delivery: Arc<DeliveryService>,
    active: DashMap<JobId, RecordHandle>,
    finished: Mutex<FinishedJobs>,
    events: broadcast::Sender<JobEvent>,
    cancellation_token: CancellationToken,
    background: TaskTracker,
}

impl PipelineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        retry: RetryPolicy,
        pools: Arc<WorkerPoolManager>,
        store: Arc<dyn PipelineStore>,
        delivery: Arc<DeliveryService>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        Arc::new(Self {
            finished: Mutex::new(FinishedJobs::new(config.finished_job_cache)),
            config,
            retry,
            pools,
            store,
            delivery,
            active: DashMap::new(),
            events,
            cancellation_token: CancellationToken::new(),
            background: TaskTracker::new(),
        })
    }

    /// Start consuming stage completions, then resume whatever the store holds.
    pub async fn start(self: &Arc<Self>) -> Result<RecoveryReport> {
        match self.pools.take_completions() {
            Some(rx) => {
                self.background.spawn(self.clone().run_completions(rx));
            }
            None => warn!("Stage completion stream was already taken"),
        }
        self.recover().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    /// Accept a job. Validation and backpressure errors are returned here and
    /// the job is not tracked.
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobSnapshot> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Overloaded("orchestrator is shutting down".to_string()));
        }

        request
            .payload
            .validate(self.config.max_text_chars)
            .map_err(Error::Validation)?;
        request.validate_callback().map_err(Error::Validation)?;

        let job = Job::from_request(request, &self.config.default_tier);
        if job.is_past_deadline(Utc::now()) {
            return Err(Error::validation("deadline has already passed"));
        }

        let plan = StagePlan::for_payload(&job.payload);
        for stage in plan.model_stages() {
            let key = PoolKey::new(stage, job.tier.clone());
            if !self.pools.has_pool(&key) {
                return Err(Error::validation(format!("no worker pool for {}", key)));
            }
        }
        let first = plan
            .next_after(Stage::Validate)
            .ok_or_else(|| Error::Other(format!("{} job has no model stage", job.kind)))?;

        let mut record = PipelineRecord::new(job);
        let job_id = record.job_id().clone();
        let input = record
            .artifacts
            .input_for(first, &record.job.payload)
            .map_err(Error::Validation)?;

        record.transition(JobStatus::Running)?;
        record.complete_stage(Stage::Validate);
        record.job.stage = first;

        self.emit(JobEvent::Accepted {
            job_id: job_id.clone(),
            kind: record.job.kind,
            priority: record.job.priority,
        });
        self.emit(JobEvent::StageStarted {
            job_id: job_id.clone(),
            stage: Stage::Validate,
            attempt: 1,
        });
        self.emit(JobEvent::StageCompleted {
            job_id: job_id.clone(),
            stage: Stage::Validate,
        });

        let handle: RecordHandle = Arc::new(AsyncMutex::new(record));
        let record = handle.lock().await;
        self.active.insert(job_id.clone(), handle.clone());

        if let Err(e) = self.store.save(&record).await {
            self.active.remove(&job_id);
            return Err(e);
        }

        let request = StageRequest::new(
            job_id.clone(),
            record.job.tier.clone(),
            input,
            record.job.priority,
            record.attempt,
        );
        if let Err(e) = self.pools.enqueue(request) {
            self.active.remove(&job_id);
            if let Err(delete_err) = self.store.delete(&job_id).await {
                warn!(job_id = %job_id, error = %delete_err, "Failed to drop rejected record");
            }
            debug!(job_id = %job_id, error = %e, "Job rejected at enqueue");
            return Err(e);
        }

        self.emit(JobEvent::StageStarted {
            job_id: job_id.clone(),
            stage: first,
            attempt: record.attempt,
        });
        info!(
            job_id = %job_id,
            kind = %record.job.kind,
            priority = %record.job.priority,
            tier = %record.job.tier,
            "Job accepted"
        );
        Ok(record.snapshot())
    }

    /// Submit and wait for the job's terminal event.
    pub async fn submit_and_wait(
        self: &Arc<Self>,
        request: JobRequest,
        timeout: Duration,
    ) -> Result<TerminalEvent> {
        let mut events = self.events.subscribe();
        let job_id = self.submit(request).await?.job_id;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(JobEvent::Terminal(event)) if event.job_id == job_id => return Ok(event),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(job_id = %job_id, skipped, "Job event receiver lagged");
                        if let Some(event) = self.status(&job_id).await?.terminal_event() {
                            return Ok(event);
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::Cancelled("orchestrator stopped".to_string()));
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "job {} did not finish within {}ms",
                job_id,
                timeout.as_millis()
            ))),
        }
    }

    /// Cancel a non-terminal job. Queued stage requests are removed; a result
    /// already in flight is discarded when it arrives.
    pub async fn cancel(self: &Arc<Self>, job_id: &JobId) -> Result<JobSnapshot> {
        let Some(handle) = self.handle(job_id) else {
            let snapshot = self.status(job_id).await?;
            return Err(Error::InvalidStateTransition {
                from: snapshot.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        };

        let mut record = handle.lock().await;
        if record.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: record.status().to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }

        let removed = self.pools.cancel_job(job_id);
        info!(job_id = %job_id, stage = %record.job.stage, removed, "Cancelling job");
        self.finish(
            &mut record,
            JobStatus::Cancelled,
            Some(WireError::new(ErrorCode::Cancelled, "cancelled by caller")),
        )
        .await;
        Ok(record.snapshot())
    }

    pub async fn status(&self, job_id: &JobId) -> Result<JobSnapshot> {
        if let Some(handle) = self.handle(job_id) {
            return Ok(handle.lock().await.snapshot());
        }
        if let Some(snapshot) = self.finished.lock().get(job_id) {
            return Ok(snapshot);
        }
        match self.store.load(job_id).await? {
            Some(record) => Ok(record.snapshot()),
            None => Err(Error::not_found("job", job_id.as_str())),
        }
    }

    /// Resume unfinished jobs at their current stage and resend terminal
    /// events that were never confirmed delivered.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        let records = self.store.load_recoverable().await?;
        let mut report = RecoveryReport::default();

        for mut record in records {
            let job_id = record.job_id().clone();
            if self.active.contains_key(&job_id) {
                continue;
            }

            if record.is_terminal() {
                if let Some(event) = record.terminal_event() {
                    self.active
                        .insert(job_id.clone(), Arc::new(AsyncMutex::new(record)));
                    self.spawn_delivery(event);
                    report.redelivered += 1;
                }
                continue;
            }

            if record.status() == JobStatus::Pending {
                record.transition(JobStatus::Running)?;
            }
            if record.job.stage == Stage::Validate {
                match StagePlan::for_payload(&record.job.payload).next_after(Stage::Validate) {
                    Some(first) => {
                        record.complete_stage(Stage::Validate);
                        record.job.stage = first;
                    }
                    None => continue,
                }
            }

            let handle: RecordHandle = Arc::new(AsyncMutex::new(record));
            let mut record = handle.lock().await;
            self.active.insert(job_id.clone(), handle.clone());
            debug!(job_id = %job_id, stage = %record.job.stage, attempt = record.attempt, "Resuming job");
            self.dispatch_stage(&mut record).await;
            report.resumed += 1;
        }

        if report.resumed > 0 || report.redelivered > 0 {
            info!(
                resumed = report.resumed,
                redelivered = report.redelivered,
                "Recovered pipeline records"
            );
        }
        Ok(report)
    }

    /// Stop consuming completions and pending retries, then wait for
    /// background work. Undelivered terminal events stay in the store.
    pub async fn shutdown(&self) {
        info!(active = self.active.len(), "Shutting down orchestrator");
        self.cancellation_token.cancel();
        self.background.close();
        self.background.wait().await;
    }

    fn handle(&self, job_id: &JobId) -> Option<RecordHandle> {
        self.active.get(job_id).map(|entry| entry.value().clone())
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist(&self, record: &PipelineRecord) {
        if let Err(e) = self.store.save(record).await {
            error!(job_id = %record.job_id(), error = %e, "Failed to persist pipeline record");
        }
    }

    async fn run_completions(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<StageCompletion>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => break,
                completion = rx.recv() => match completion {
                    Some(completion) => self.handle_completion(completion).await,
                    None => break,
                },
            }
        }
        debug!("Completion loop stopped");
    }

    async fn handle_completion(self: &Arc<Self>, completion: StageCompletion) {
        let Some(handle) = self.handle(&completion.job_id) else {
            debug!(job_id = %completion.job_id, stage = %completion.stage, "Discarding result for inactive job");
            return;
        };

        let mut record = handle.lock().await;
        if record.is_terminal()
            || record.job.stage != completion.stage
            || record.attempt != completion.attempt
        {
            debug!(
                job_id = %completion.job_id,
                stage = %completion.stage,
                attempt = completion.attempt,
                status = %record.status(),
                "Discarding stale stage result"
            );
            return;
        }

        match completion.result {
            Ok(output) => self.advance(&mut record, output).await,
            Err(error) => self.stage_failed(&mut record, error).await,
        }
    }

    async fn advance(self: &Arc<Self>, record: &mut PipelineRecord, output: StageOutput) {
        let stage = record.job.stage;
        record.artifacts.apply(output);
        record.complete_stage(stage);
        self.emit(JobEvent::StageCompleted {
            job_id: record.job_id().clone(),
            stage,
        });

        match StagePlan::for_payload(&record.job.payload).next_after(stage) {
            Some(next) => {
                record.job.stage = next;
                record.attempt = 1;
                self.dispatch_stage(record).await;
            }
            None => self.finish(record, JobStatus::Succeeded, None).await,
        }
    }

    /// Persist, then enqueue the record's current stage.
    async fn dispatch_stage(self: &Arc<Self>, record: &mut PipelineRecord) {
        let stage = record.job.stage;
        if record.job.is_past_deadline(Utc::now()) {
            let error = WireError::new(
                ErrorCode::Timeout,
                format!("deadline passed before {} could start", stage),
            );
            self.finish(record, JobStatus::Failed, Some(error)).await;
            return;
        }

        let input = match record.artifacts.input_for(stage, &record.job.payload) {
            Ok(input) => input,
            Err(msg) => {
                let error = WireError::new(ErrorCode::ValidationError, msg);
                self.finish(record, JobStatus::Failed, Some(error)).await;
                return;
            }
        };

        record.touch();
        self.persist(record).await;

        self.emit(JobEvent::StageStarted {
            job_id: record.job_id().clone(),
            stage,
            attempt: record.attempt,
        });
        let request = StageRequest::new(
            record.job_id().clone(),
            record.job.tier.clone(),
            input,
            record.job.priority,
            record.attempt,
        );
        if let Err(e) = self.pools.enqueue(request) {
            self.stage_failed(record, e.to_wire()).await;
        }
    }

    async fn stage_failed(self: &Arc<Self>, record: &mut PipelineRecord, error: WireError) {
        let stage = record.job.stage;
        let attempt = record.attempt;
        record.job.last_error = Some(error.clone());

        let within_deadline = !record.job.is_past_deadline(Utc::now());
        if error.is_retryable() && self.retry.allows_retry(attempt) && within_deadline {
            let delay = self.retry.delay_for(attempt);
            record.attempt += 1;
            record.job.retry_count += 1;
            record.touch();
            self.persist(record).await;

            warn!(
                job_id = %record.job_id(),
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %error.code,
                error = %error.message,
                "Stage failed, retrying"
            );
            self.emit(JobEvent::StageRetry {
                job_id: record.job_id().clone(),
                stage,
                next_attempt: record.attempt,
                delay_ms: delay.as_millis() as u64,
                error,
            });
            self.schedule_retry(record.job_id().clone(), stage, record.attempt, delay);
        } else {
            warn!(
                job_id = %record.job_id(),
                stage = %stage,
                attempt,
                code = %error.code,
                error = %error.message,
                "Stage failed permanently"
            );
            let error = if error.is_retryable() && !within_deadline {
                WireError::new(
                    ErrorCode::Timeout,
                    format!("deadline passed after {} failed: {}", stage, error.message),
                )
            } else {
                error
            };
            self.finish(record, JobStatus::Failed, Some(error)).await;
        }
    }

    fn schedule_retry(self: &Arc<Self>, job_id: JobId, stage: Stage, attempt: u32, delay: Duration) {
        let this = self.clone();
        self.background.spawn(async move {
            tokio::select! {
                _ = this.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(handle) = this.handle(&job_id) else {
                return;
            };
            let mut record = handle.lock().await;
            if record.is_terminal() || record.job.stage != stage || record.attempt != attempt {
                return;
            }
            this.dispatch_stage(&mut record).await;
        });
    }

    /// Move to a terminal state and hand the event to delivery. Called at most
    /// once per job: a second call fails the transition and does nothing.
    async fn finish(
        self: &Arc<Self>,
        record: &mut PipelineRecord,
        status: JobStatus,
        error: Option<WireError>,
    ) {
        let previous_error = record.job.last_error.clone();
        if error.is_some() {
            record.job.last_error = error;
        }
        if let Err(e) = record.transition(status) {
            record.job.last_error = previous_error;
            warn!(job_id = %record.job_id(), error = %e, "Ignoring second terminal transition");
            return;
        }
        self.persist(record).await;

        let Some(event) = record.terminal_event() else {
            return;
        };
        info!(
            job_id = %record.job_id(),
            status = %status,
            stage = %record.job.stage,
            retries = record.job.retry_count,
            "Job finished"
        );
        self.emit(JobEvent::Terminal(event.clone()));
        self.spawn_delivery(event);
    }

    fn spawn_delivery(self: &Arc<Self>, event: TerminalEvent) {
        let this = self.clone();
        self.background.spawn(async move {
            let outcome = tokio::select! {
                _ = this.cancellation_token.cancelled() => {
                    debug!(job_id = %event.job_id, "Delivery interrupted by shutdown");
                    return;
                }
                outcome = this.delivery.deliver(&event) => outcome,
            };
            this.complete_delivery(&event.job_id, outcome.is_complete()).await;
        });
    }

    /// Release a finished job. A record whose event was dead-lettered by some
    /// sink stays in the store so a restart delivers it again.
    async fn complete_delivery(&self, job_id: &JobId, delivered: bool) {
        let Some((_, handle)) = self.active.remove(job_id) else {
            return;
        };

        let snapshot = {
            let mut record = handle.lock().await;
            record.terminal_delivered = delivered;
            if delivered {
                if let Err(e) = self.store.delete(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to release pipeline record");
                }
            } else {
                self.persist(&record).await;
            }
            record.snapshot()
        };

        self.finished.lock().insert(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, DeliveryConfig, PoolConfig, PoolSettings, ScalingConfig};
    use crate::delivery::{EventSink, PublishSink};
    use crate::domain::{JobPayload, Priority, Tier};
    use crate::model::{ScriptedModelFactory, ScriptedStep};
    use crate::pipeline::store::MemoryPipelineStore;

    struct Harness {
        orchestrator: Arc<PipelineOrchestrator>,
        pools: Arc<WorkerPoolManager>,
        store: Arc<MemoryPipelineStore>,
        publish: PublishSink,
    }

    fn pool_settings(batch_timeout_ms: u64) -> Vec<PoolSettings> {
        Stage::MODEL_STAGES
            .iter()
            .map(|stage| PoolSettings {
                key: PoolKey::new(*stage, Tier::default()),
                pool: PoolConfig {
                    min_workers: 1,
                    max_workers: 2,
                    batch_timeout_ms,
                },
                batch: BatchConfig {
                    max_batch_size: 4,
                    max_wait_ms: 5,
                },
                queue_capacity: 16,
            })
            .collect()
    }

    async fn harness(factory: ScriptedModelFactory, retry: RetryPolicy, batch_timeout_ms: u64) -> Harness {
        let pools = Arc::new(WorkerPoolManager::new(
            pool_settings(batch_timeout_ms),
            ScalingConfig {
                enabled: false,
                ..Default::default()
            },
            Arc::new(factory),
        ));
        pools.start().await;

        let publish = PublishSink::new(64);
        let delivery = Arc::new(DeliveryService::new(
            &DeliveryConfig::default(),
            vec![Arc::new(publish.clone()) as Arc<dyn EventSink>],
        ));
        let store = Arc::new(MemoryPipelineStore::new());
        let orchestrator = PipelineOrchestrator::new(
            OrchestratorConfig::default(),
            retry,
            pools.clone(),
            store.clone(),
            delivery,
        );
        orchestrator.start().await.unwrap();
        Harness {
            orchestrator,
            pools,
            store,
            publish,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 20,
        }
    }

    fn translation(text: &str) -> JobRequest {
        JobRequest::new(JobPayload::Translation {
            text: text.into(),
            source_language: Some("en".into()),
            target_languages: vec!["fr".into(), "de".into()],
        })
    }

    fn voice(profile: Option<&str>, targets: &[&str]) -> JobRequest {
        JobRequest::new(JobPayload::VoicePipeline {
            audio_ref: "s3://bucket/clip.wav".into(),
            source_language: None,
            target_languages: targets.iter().map(|t| t.to_string()).collect(),
            voice_profile: profile.map(str::to_string),
        })
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_translation_succeeds() {
        let h = harness(ScriptedModelFactory::new(), fast_retry(3), 5_000).await;
        let event = h
            .orchestrator
            .submit_and_wait(translation("good morning"), WAIT)
            .await
            .unwrap();

        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        let result = event.result.unwrap();
        assert_eq!(result.translations.get("fr").map(String::as_str), Some("[fr] good morning"));
        assert_eq!(result.translations.len(), 2);
        h.orchestrator.shutdown().await;
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_voice_pipeline_runs_every_stage() {
        let factory = ScriptedModelFactory::new();
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;
        let event = h
            .orchestrator
            .submit_and_wait(voice(Some("narrator"), &["es"]), WAIT)
            .await
            .unwrap();

        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        let result = event.result.unwrap();
        assert!(result.transcript.is_some());
        assert!(result.voice_embedding.as_deref().unwrap().starts_with("voice://narrator/"));
        assert!(result.audio.get("es").unwrap().starts_with("audio://voice://narrator"));
        for stage in Stage::MODEL_STAGES {
            assert_eq!(factory.invocations(stage), 1, "{}", stage);
        }

        let snapshot = h.orchestrator.status(&event.job_id).await.unwrap();
        assert_eq!(snapshot.stages_total, 5);
        assert_eq!(snapshot.stages_completed.len(), 5);
        assert_eq!(snapshot.stages_completed[0], Stage::Validate);
        assert_eq!(snapshot.stages_completed.last(), Some(&snapshot.stage));
        assert_eq!(snapshot.progress(), 1.0);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_clone_skipped_without_profile() {
        let factory = ScriptedModelFactory::new();
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;
        let event = h
            .orchestrator
            .submit_and_wait(voice(None, &["es"]), WAIT)
            .await
            .unwrap();

        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        assert_eq!(factory.invocations(Stage::CloneVoice), 0);
        assert_eq!(factory.invocations(Stage::Synthesize), 1);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_transcription_only() {
        let factory = ScriptedModelFactory::new();
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;
        let event = h
            .orchestrator
            .submit_and_wait(voice(None, &[]), WAIT)
            .await
            .unwrap();

        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        assert_eq!(event.stage, Stage::Transcribe);
        assert_eq!(factory.invocations(Stage::Translate), 0);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_rejected_synchronously() {
        let h = harness(ScriptedModelFactory::new(), fast_retry(3), 5_000).await;
        let err = h.orchestrator.submit(translation("   ")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(h.orchestrator.active_jobs(), 0);
        assert!(h.store.is_empty());

        let err = h
            .orchestrator
            .submit(translation("hi").with_tier(Tier::new("large")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = h
            .orchestrator
            .submit(translation("hi").with_webhook("ftp://hooks.example.com/done"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(h.store.is_empty());
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_model_failure_retried_then_succeeds() {
        let factory = ScriptedModelFactory::new();
        factory.script(Stage::Translate, [ScriptedStep::Fail("transient".into())]);
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;

        let mut events = h.orchestrator.subscribe();
        let event = h
            .orchestrator
            .submit_and_wait(translation("retry me"), WAIT)
            .await
            .unwrap();
        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        assert_eq!(event.retry_count, 1);
        assert_eq!(factory.invocations(Stage::Translate), 2);

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::StageRetry { next_attempt, .. } = event {
                assert_eq!(next_attempt, 2);
                saw_retry = true;
            }
        }
        assert!(saw_retry);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_input_not_retried() {
        let factory = ScriptedModelFactory::new();
        factory.script(Stage::Translate, [ScriptedStep::RejectInput("unsupported language".into())]);
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;

        let event = h
            .orchestrator
            .submit_and_wait(translation("hola"), WAIT)
            .await
            .unwrap();
        assert_eq!(event.terminal_status, JobStatus::Failed);
        assert_eq!(event.error.unwrap().code, ErrorCode::ValidationError);
        assert_eq!(factory.invocations(Stage::Translate), 1);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_once() {
        let factory = ScriptedModelFactory::new();
        factory.script(
            Stage::Translate,
            [
                ScriptedStep::Fail("boom".into()),
                ScriptedStep::Fail("boom".into()),
            ],
        );
        let h = harness(factory.clone(), fast_retry(2), 5_000).await;
        let mut published = h.publish.subscribe();

        let event = h
            .orchestrator
            .submit_and_wait(translation("doomed"), WAIT)
            .await
            .unwrap();
        assert_eq!(event.terminal_status, JobStatus::Failed);
        assert_eq!(event.error.unwrap().code, ErrorCode::ModelFailure);
        assert_eq!(event.retry_count, 1);

        let delivered = tokio::time::timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.job_id, event.job_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(published.try_recv().is_err());
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let factory = ScriptedModelFactory::new().with_latency(Stage::Translate, Duration::from_millis(200));
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;

        // The first job holds the only worker; the others wait in the queue.
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let snapshot = h
                .orchestrator
                .submit(translation(text).with_priority(Priority::Low))
                .await
                .unwrap();
            ids.push(snapshot.job_id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let cancelled = h.orchestrator.cancel(&ids[2]).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let err = h.orchestrator.cancel(&ids[2]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let err = h.orchestrator.cancel(&JobId::from("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_in_flight_discards_result() {
        let factory = ScriptedModelFactory::new().with_latency(Stage::Translate, Duration::from_millis(150));
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;
        let mut published = h.publish.subscribe();

        let job_id = h.orchestrator.submit(translation("in flight")).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orchestrator.cancel(&job_id).await.unwrap();

        let event = tokio::time::timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(event.terminal_status, JobStatus::Cancelled);

        // The model call still completes; its result must not produce a second event.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(published.try_recv().is_err());
        assert_eq!(
            h.orchestrator.status(&job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_record_released_after_delivery() {
        let h = harness(ScriptedModelFactory::new(), fast_retry(3), 5_000).await;
        let event = h
            .orchestrator
            .submit_and_wait(translation("release"), WAIT)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.orchestrator.active_jobs(), 0);
        assert!(h.store.load(&event.job_id).await.unwrap().is_none());

        let snapshot = h.orchestrator.status(&event.job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert!(snapshot.result.is_some());
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_resumes_running_record() {
        let factory = ScriptedModelFactory::new();
        let h = harness(factory.clone(), fast_retry(3), 5_000).await;
        let mut published = h.publish.subscribe();

        let mut record = PipelineRecord::new(Job::from_request(translation("left behind"), &Tier::default()));
        record.transition(JobStatus::Running).unwrap();
        record.job.stage = Stage::Translate;
        h.store.save(&record).await.unwrap();

        let report = h.orchestrator.recover().await.unwrap();
        assert_eq!(report.resumed, 1);

        let event = tokio::time::timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(&event.job_id, record.job_id());
        assert_eq!(event.terminal_status, JobStatus::Succeeded);
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_redelivers_terminal_record() {
        let h = harness(ScriptedModelFactory::new(), fast_retry(3), 5_000).await;
        let mut published = h.publish.subscribe();

        let mut record = PipelineRecord::new(Job::from_request(translation("done"), &Tier::default()));
        record.transition(JobStatus::Failed).unwrap();
        h.store.save(&record).await.unwrap();

        let report = h.orchestrator.recover().await.unwrap();
        assert_eq!(report.redelivered, 1);
        let event = tokio::time::timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(event.terminal_status, JobStatus::Failed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.is_empty());
        h.pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_passed_before_retry_fails_with_timeout() {
        let factory = ScriptedModelFactory::new();
        factory.script(Stage::Translate, [ScriptedStep::Fail("slow start".into())]);
        let h = harness(
            factory,
            RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 300,
                max_delay_ms: 300,
            },
            5_000,
        )
        .await;

        let deadline = Utc::now() + chrono::Duration::milliseconds(150);
        let event = h
            .orchestrator
            .submit_and_wait(translation("hurry").with_deadline(deadline), WAIT)
            .await
            .unwrap();
        assert_eq!(event.terminal_status, JobStatus::Failed);
        assert_eq!(event.error.unwrap().code, ErrorCode::Timeout);
        h.pools.shutdown().await;
    }

    #[test]
    fn test_finished_cache_is_bounded() {
        let mut cache = FinishedJobs::new(2);
        let snapshots: Vec<JobSnapshot> = (0..3)
            .map(|i| {
                PipelineRecord::new(Job::from_request(translation(&format!("t{}", i)), &Tier::default()))
                    .snapshot()
            })
            .collect();
        for snapshot in &snapshots {
            cache.insert(snapshot.clone());
        }
        assert!(cache.get(&snapshots[0].job_id).is_none());
        assert!(cache.get(&snapshots[2].job_id).is_some());
    }
}
