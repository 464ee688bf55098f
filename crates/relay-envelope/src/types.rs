use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message kind carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Caller to service, expects a REPLY with the same correlation id.
    Request,
    /// Service to caller, answers a REQUEST.
    Reply,
    /// Service to subscribers, keyed by job id.
    Event,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Request => 1,
            MessageKind::Reply => 2,
            MessageKind::Event => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Reply),
            3 => Some(MessageKind::Event),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Reply => write!(f, "REPLY"),
            MessageKind::Event => write!(f, "EVENT"),
        }
    }
}

/// Stable error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input, never retried.
    ValidationError,
    /// Queue or pool saturated, retry later with backoff.
    Overloaded,
    /// Model inference failed after the stage retry budget.
    ModelFailure,
    /// A request, stage, or job deadline elapsed.
    Timeout,
    /// Caller-initiated cancellation.
    Cancelled,
    /// Unknown job or resource.
    NotFound,
    /// Anything else; details stay server-side.
    Internal,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::ValidationError => 1,
            ErrorCode::Overloaded => 2,
            ErrorCode::ModelFailure => 3,
            ErrorCode::Timeout => 4,
            ErrorCode::Cancelled => 5,
            ErrorCode::NotFound => 6,
            ErrorCode::Internal => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::ValidationError),
            2 => Some(ErrorCode::Overloaded),
            3 => Some(ErrorCode::ModelFailure),
            4 => Some(ErrorCode::Timeout),
            5 => Some(ErrorCode::Cancelled),
            6 => Some(ErrorCode::NotFound),
            7 => Some(ErrorCode::Internal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Overloaded => "OVERLOADED",
            ErrorCode::ModelFailure => "MODEL_FAILURE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Overloaded | ErrorCode::ModelFailure | ErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error attached to a REPLY or EVENT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub correlation_id: String,
    pub job_id: Option<String>,
    pub stage: Option<String>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
    pub error: Option<WireError>,
}

impl Envelope {
    fn new(kind: MessageKind, correlation_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.into(),
            job_id: None,
            stage: None,
            payload,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Create a request with the given correlation id.
    pub fn request(correlation_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, correlation_id, payload.into())
    }

    /// Create a successful reply to `request`.
    pub fn reply_to(request: &Envelope, payload: impl Into<Bytes>) -> Self {
        let mut reply = Self::new(
            MessageKind::Reply,
            request.correlation_id.clone(),
            payload.into(),
        );
        reply.job_id = request.job_id.clone();
        reply.stage = request.stage.clone();
        reply
    }

    /// Create an error reply to `request`.
    pub fn error_reply(request: &Envelope, error: WireError) -> Self {
        let mut reply = Self::reply_to(request, Bytes::new());
        reply.error = Some(error);
        reply
    }

    /// Create a publish event for a job. Events carry the job id as their
    /// correlation id so subscribers can match without extra state.
    pub fn event(job_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let job_id = job_id.into();
        let mut event = Self::new(MessageKind::Event, job_id.clone(), payload.into());
        event.job_id = Some(job_id);
        event
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_error(mut self, error: WireError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
