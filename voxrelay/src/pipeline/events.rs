use relay_envelope::WireError;
use serde::Serialize;

use crate::delivery::TerminalEvent;
use crate::domain::{JobId, JobKind, Priority, Stage};

/// Job lifecycle events broadcast by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Accepted {
        job_id: JobId,
        kind: JobKind,
        priority: Priority,
    },
    StageStarted {
        job_id: JobId,
        stage: Stage,
        attempt: u32,
    },
    StageCompleted {
        job_id: JobId,
        stage: Stage,
    },
    StageRetry {
        job_id: JobId,
        stage: Stage,
        next_attempt: u32,
        delay_ms: u64,
        error: WireError,
    },
    Terminal(TerminalEvent),
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Accepted { job_id, .. }
            | JobEvent::StageStarted { job_id, .. }
            | JobEvent::StageCompleted { job_id, .. }
            | JobEvent::StageRetry { job_id, .. } => job_id,
            JobEvent::Terminal(event) => &event.job_id,
        }
    }
}
