use chrono::{DateTime, Utc};
use relay_envelope::WireError;
use serde::{Deserialize, Serialize};

use crate::delivery::TerminalEvent;
use crate::domain::{Job, JobId, JobKind, JobStatus, Priority, Stage, StageArtifacts, StagePlan, Tier};
use crate::{Error, Result};

/// Durable state of one job: enough to resume it after a restart and to
/// deliver its terminal event exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub job: Job,
    /// 1-based attempt of the current stage.
    pub attempt: u32,
    pub artifacts: StageArtifacts,
    /// Stages finished so far, in order.
    #[serde(default)]
    pub stages_completed: Vec<Stage>,
    pub terminal_delivered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(job: Job) -> Self {
        let now = Utc::now();
        Self {
            job,
            attempt: 1,
            artifacts: StageArtifacts::default(),
            stages_completed: Vec::new(),
            terminal_delivered: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn is_terminal(&self) -> bool {
        self.job.status.is_terminal()
    }

    /// Record `stage` as finished. Repeats are ignored.
    pub fn complete_stage(&mut self, stage: Stage) {
        if !self.stages_completed.contains(&stage) {
            self.stages_completed.push(stage);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to `to`. Terminal states are final, and PENDING cannot be re-entered.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        let from = self.job.status;
        let allowed = match (from, to) {
            (f, _) if f.is_terminal() => false,
            (_, JobStatus::Pending) => false,
            (JobStatus::Pending, _) => true,
            (JobStatus::Running, JobStatus::Running) => true,
            (JobStatus::Running, t) => t.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.job.status = to;
        self.touch();
        Ok(())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job.id.clone(),
            kind: self.job.kind,
            status: self.job.status,
            stage: self.job.stage,
            priority: self.job.priority,
            tier: self.job.tier.clone(),
            attempt: self.attempt,
            retry_count: self.job.retry_count,
            last_error: self.job.last_error.clone(),
            submitted_at: self.job.submitted_at,
            deadline: self.job.deadline,
            updated_at: self.updated_at,
            stages_completed: self.stages_completed.clone(),
            stages_total: StagePlan::for_payload(&self.job.payload).stages().len(),
            result: (self.job.status == JobStatus::Succeeded).then(|| self.artifacts.clone()),
            callback_metadata: self.job.callback_metadata.clone(),
            webhook_url: self.job.webhook_url.clone(),
        }
    }

    pub fn terminal_event(&self) -> Option<TerminalEvent> {
        self.snapshot().terminal_event()
    }
}

/// Per-job status view returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub stage: Stage,
    pub priority: Priority,
    pub tier: Tier,
    pub attempt: u32,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WireError>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stages_completed: Vec<Stage>,
    /// Length of the job's stage plan, VALIDATE included.
    #[serde(default)]
    pub stages_total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageArtifacts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl JobSnapshot {
    /// Fraction of the stage plan finished, 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.stages_total == 0 {
            return 0.0;
        }
        (self.stages_completed.len() as f64 / self.stages_total as f64).min(1.0)
    }

    /// The terminal event this job produced, if it has finished.
    pub fn terminal_event(&self) -> Option<TerminalEvent> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(TerminalEvent {
            job_id: self.job_id.clone(),
            terminal_status: self.status,
            stage: self.stage,
            result: self.result.clone(),
            error: match self.status {
                JobStatus::Succeeded => None,
                _ => self.last_error.clone(),
            },
            retry_count: self.retry_count,
            completed_at: self.updated_at,
            callback_metadata: self.callback_metadata.clone(),
            webhook_url: self.webhook_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, JobRequest};
    use relay_envelope::ErrorCode;

    fn record() -> PipelineRecord {
        let request = JobRequest::new(JobPayload::Translation {
            text: "hello".into(),
            source_language: None,
            target_languages: vec!["fr".into()],
        });
        PipelineRecord::new(Job::from_request(request, &Tier::default()))
    }

    #[test]
    fn test_transitions() {
        let mut rec = record();
        assert_eq!(rec.status(), JobStatus::Pending);
        rec.transition(JobStatus::Running).unwrap();
        rec.transition(JobStatus::Succeeded).unwrap();

        let err = rec.transition(JobStatus::Cancelled).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(rec.transition(JobStatus::Running).is_err());
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut rec = record();
        rec.transition(JobStatus::Cancelled).unwrap();
        assert!(rec.is_terminal());
    }

    #[test]
    fn test_terminal_event_only_when_finished() {
        let mut rec = record();
        assert!(rec.terminal_event().is_none());

        rec.transition(JobStatus::Running).unwrap();
        rec.job.last_error = Some(WireError::new(ErrorCode::Timeout, "slow"));
        rec.transition(JobStatus::Failed).unwrap();

        let event = rec.terminal_event().unwrap();
        assert_eq!(event.terminal_status, JobStatus::Failed);
        assert_eq!(event.error.unwrap().code, ErrorCode::Timeout);
        assert!(event.result.is_none());
    }

    #[test]
    fn test_record_json_round_trip() {
        let rec = record();
        let json = serde_json::to_string(&rec).unwrap();
        let back: PipelineRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id(), rec.job_id());
        assert_eq!(back.job.payload, rec.job.payload);
    }

    #[test]
    fn test_progress_and_callback_in_snapshot() {
        let request = JobRequest::new(JobPayload::Translation {
            text: "hello".into(),
            source_language: None,
            target_languages: vec!["fr".into()],
        })
        .with_webhook("http://127.0.0.1:9/hook")
        .with_callback_metadata(serde_json::json!({"ticket": "T-1"}));
        let mut rec = PipelineRecord::new(Job::from_request(request, &Tier::default()));

        assert_eq!(rec.snapshot().stages_total, 2);
        assert_eq!(rec.snapshot().progress(), 0.0);

        rec.complete_stage(Stage::Validate);
        rec.complete_stage(Stage::Validate);
        assert_eq!(rec.snapshot().stages_completed, vec![Stage::Validate]);
        assert_eq!(rec.snapshot().progress(), 0.5);

        rec.transition(JobStatus::Running).unwrap();
        rec.complete_stage(Stage::Translate);
        rec.transition(JobStatus::Succeeded).unwrap();
        let snapshot = rec.snapshot();
        assert_eq!(snapshot.progress(), 1.0);

        let event = snapshot.terminal_event().unwrap();
        assert_eq!(event.callback_metadata, Some(serde_json::json!({"ticket": "T-1"})));
        assert_eq!(event.webhook_url.as_deref(), Some("http://127.0.0.1:9/hook"));
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(body["callback_metadata"]["ticket"], "T-1");
        assert!(body.get("webhook_url").is_none());

        let json = serde_json::to_string(&rec).unwrap();
        let back: PipelineRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages_completed, vec![Stage::Validate, Stage::Translate]);
        assert_eq!(back.job.callback_metadata, rec.job.callback_metadata);
    }
}
