use chrono::{DateTime, Utc};
use relay_envelope::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::stage::{Stage, Tier};

/// Texts shorter than this are promoted to HIGH when no priority is given.
const SHORT_TEXT_CHARS: usize = 100;
/// Texts shorter than this (and not short) get NORMAL; longer ones get LOW.
const MEDIUM_TEXT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Scheduling priority. Higher variants are dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Priority hint derived from the length of a text to translate.
    pub fn for_text_len(chars: usize) -> Self {
        if chars < SHORT_TEXT_CHARS {
            Priority::High
        } else if chars < MEDIUM_TEXT_CHARS {
            Priority::Normal
        } else {
            Priority::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Translation,
    VoicePipeline,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Translation => write!(f, "translation"),
            JobKind::VoicePipeline => write!(f, "voice_pipeline"),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Typed payload per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Translation {
        text: String,
        #[serde(default)]
        source_language: Option<String>,
        target_languages: Vec<String>,
    },
    VoicePipeline {
        /// Location of the source audio; the service never reads it itself.
        audio_ref: String,
        #[serde(default)]
        source_language: Option<String>,
        /// Empty means transcription only.
        #[serde(default)]
        target_languages: Vec<String>,
        #[serde(default)]
        voice_profile: Option<String>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Translation { .. } => JobKind::Translation,
            JobPayload::VoicePipeline { .. } => JobKind::VoicePipeline,
        }
    }

    pub fn target_languages(&self) -> &[String] {
        match self {
            JobPayload::Translation {
                target_languages, ..
            }
            | JobPayload::VoicePipeline {
                target_languages, ..
            } => target_languages,
        }
    }

    pub fn voice_profile(&self) -> Option<&str> {
        match self {
            JobPayload::VoicePipeline { voice_profile, .. } => voice_profile.as_deref(),
            JobPayload::Translation { .. } => None,
        }
    }

    /// Payload checks run by the VALIDATE stage.
    pub fn validate(&self, max_text_chars: usize) -> Result<(), String> {
        match self {
            JobPayload::Translation {
                text,
                target_languages,
                ..
            } => {
                if text.trim().is_empty() {
                    return Err("text must not be empty".to_string());
                }
                let chars = text.chars().count();
                if chars > max_text_chars {
                    return Err(format!(
                        "text is {} characters, limit is {}",
                        chars, max_text_chars
                    ));
                }
                if target_languages.is_empty() {
                    return Err("at least one target language is required".to_string());
                }
            }
            JobPayload::VoicePipeline {
                audio_ref,
                voice_profile,
                ..
            } => {
                if audio_ref.trim().is_empty() {
                    return Err("audio_ref must not be empty".to_string());
                }
                if voice_profile.as_deref().is_some_and(|p| p.trim().is_empty()) {
                    return Err("voice_profile must not be blank when given".to_string());
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for lang in self.target_languages() {
            if lang.trim().is_empty() {
                return Err("target language codes must not be blank".to_string());
            }
            if !seen.insert(lang.as_str()) {
                return Err(format!("duplicate target language '{}'", lang));
            }
        }
        Ok(())
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub payload: JobPayload,
    /// Derived from the payload when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Where this job's terminal event is POSTed, in addition to any
    /// service-wide webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque caller data echoed back in the terminal event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_metadata: Option<serde_json::Value>,
}

impl JobRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: None,
            deadline: None,
            tier: None,
            webhook_url: None,
            callback_metadata: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_callback_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.callback_metadata = Some(metadata);
        self
    }

    /// The per-job webhook must be an absolute http(s) URL.
    pub fn validate_callback(&self) -> Result<(), String> {
        let Some(raw) = self.webhook_url.as_deref() else {
            return Ok(());
        };
        let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid webhook_url '{}': {}", raw, e))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(format!("webhook_url '{}' must be an http or https URL", raw));
        }
        Ok(())
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Explicit priority wins; otherwise translation text length decides.
    pub fn effective_priority(&self) -> Priority {
        if let Some(priority) = self.priority {
            return priority;
        }
        match &self.payload {
            JobPayload::Translation { text, .. } => Priority::for_text_len(text.chars().count()),
            JobPayload::VoicePipeline { .. } => Priority::Normal,
        }
    }
}

/// A submitted job as tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub tier: Tier,
    pub payload: JobPayload,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub stage: Stage,
    pub status: JobStatus,
    /// Total retries across all stages.
    pub retry_count: u32,
    pub last_error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_metadata: Option<serde_json::Value>,
}

impl Job {
    pub fn from_request(request: JobRequest, default_tier: &Tier) -> Self {
        let priority = request.effective_priority();
        Self {
            id: JobId::new(),
            kind: request.payload.kind(),
            priority,
            tier: request.tier.unwrap_or_else(|| default_tier.clone()),
            payload: request.payload,
            submitted_at: Utc::now(),
            deadline: request.deadline,
            stage: Stage::Validate,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            webhook_url: request.webhook_url,
            callback_metadata: request.callback_metadata,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(text: &str) -> JobPayload {
        JobPayload::Translation {
            text: text.to_string(),
            source_language: None,
            target_languages: vec!["de".to_string()],
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_from_text_length() {
        assert_eq!(Priority::for_text_len(10), Priority::High);
        assert_eq!(Priority::for_text_len(99), Priority::High);
        assert_eq!(Priority::for_text_len(100), Priority::Normal);
        assert_eq!(Priority::for_text_len(499), Priority::Normal);
        assert_eq!(Priority::for_text_len(500), Priority::Low);
    }

    #[test]
    fn test_explicit_priority_wins() {
        let request = JobRequest::new(translation("hi")).with_priority(Priority::Low);
        assert_eq!(request.effective_priority(), Priority::Low);
        let request = JobRequest::new(translation("hi"));
        assert_eq!(request.effective_priority(), Priority::High);
    }

    #[test]
    fn test_payload_validation() {
        assert!(translation("hello").validate(1000).is_ok());
        assert!(translation("   ").validate(1000).is_err());
        assert!(translation("hello world").validate(5).is_err());

        let no_targets = JobPayload::Translation {
            text: "hello".into(),
            source_language: None,
            target_languages: vec![],
        };
        assert!(no_targets.validate(1000).is_err());

        let duplicate = JobPayload::Translation {
            text: "hello".into(),
            source_language: None,
            target_languages: vec!["fr".into(), "fr".into()],
        };
        assert!(duplicate.validate(1000).is_err());

        let transcription_only = JobPayload::VoicePipeline {
            audio_ref: "s3://bucket/a.wav".into(),
            source_language: None,
            target_languages: vec![],
            voice_profile: None,
        };
        assert!(transcription_only.validate(1000).is_ok());
    }

    #[test]
    fn test_payload_serde_tagging() {
        let json = r#"{"kind":"voice_pipeline","audio_ref":"a.wav","target_languages":["es"]}"#;
        let payload: JobPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.kind(), JobKind::VoicePipeline);
        assert_eq!(payload.voice_profile(), None);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!("CANCELLED".parse::<JobStatus>(), Ok(JobStatus::Cancelled));
    }

    #[test]
    fn test_callback_url_validation() {
        let request = JobRequest::new(translation("hi"));
        assert!(request.validate_callback().is_ok());

        let ok = JobRequest::new(translation("hi")).with_webhook("https://hooks.example.com/jobs");
        assert!(ok.validate_callback().is_ok());

        for bad in ["not a url", "ftp://hooks.example.com/x", "file:///tmp/hook"] {
            let request = JobRequest::new(translation("hi")).with_webhook(bad);
            assert!(request.validate_callback().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_callback_fields_carried_into_job() {
        let request = JobRequest::new(translation("hi"))
            .with_webhook("http://127.0.0.1:9/hook")
            .with_callback_metadata(serde_json::json!({"order": 17}));
        let job = Job::from_request(request, &Tier::default());
        assert_eq!(job.webhook_url.as_deref(), Some("http://127.0.0.1:9/hook"));
        assert_eq!(job.callback_metadata, Some(serde_json::json!({"order": 17})));

        let plain: JobRequest =
            serde_json::from_str(r#"{"payload":{"kind":"translation","text":"a","target_languages":["fr"]}}"#).unwrap();
        assert!(plain.webhook_url.is_none());
        assert!(plain.callback_metadata.is_none());
    }
}
