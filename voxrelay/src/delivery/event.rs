use chrono::{DateTime, Utc};
use relay_envelope::WireError;
use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobStatus, Stage, StageArtifacts};

/// The single business-visible outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub job_id: JobId,
    pub terminal_status: JobStatus,
    /// Last stage the job reached.
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageArtifacts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub retry_count: u32,
    pub completed_at: DateTime<Utc>,
    /// Caller data from the request, echoed back verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_metadata: Option<serde_json::Value>,
    /// Per-job webhook target. Routing only; never sent to receivers.
    #[serde(skip)]
    pub webhook_url: Option<String>,
}

impl TerminalEvent {
    /// Receivers deduplicate on this.
    pub fn idempotency_key(&self) -> &str {
        self.job_id.as_str()
    }
}
