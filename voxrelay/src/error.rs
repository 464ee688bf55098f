//! Service-wide error types.
//!
//! Every variant maps onto the stable wire taxonomy through [`Error::code`], so a
//! caller only ever sees one of the [`ErrorCode`] values, never a raw internal error.

use relay_envelope::{EnvelopeError, ErrorCode, WireError};
use thiserror::Error;

/// Service-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Model failure: {0}")]
    ModelFailure(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Stable taxonomy code reported to callers.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) | Error::InvalidStateTransition { .. } => {
                ErrorCode::ValidationError
            }
            Error::Overloaded(_) => ErrorCode::Overloaded,
            Error::ModelFailure(_) => ErrorCode::ModelFailure,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::Configuration(_)
            | Error::Database(_)
            | Error::Migration(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Transport(_)
            | Error::Other(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Convert into the wire error carried by replies and terminal events.
    ///
    /// Internal failures keep only a generic message.
    pub fn to_wire(&self) -> WireError {
        match self.code() {
            ErrorCode::Internal => WireError::new(ErrorCode::Internal, "internal error"),
            code => WireError::new(code, self.detail()),
        }
    }

    /// Rebuild a typed error from a wire error received from a peer.
    pub fn from_wire(error: WireError) -> Self {
        let WireError { code, message } = error;
        match code {
            ErrorCode::ValidationError => Error::Validation(message),
            ErrorCode::Overloaded => Error::Overloaded(message),
            ErrorCode::ModelFailure => Error::ModelFailure(message),
            ErrorCode::Timeout => Error::Timeout(message),
            ErrorCode::Cancelled => Error::Cancelled(message),
            ErrorCode::NotFound => Error::NotFound {
                entity_type: "remote".to_string(),
                id: message,
            },
            ErrorCode::Internal => Error::Other(message),
        }
    }

    fn detail(&self) -> String {
        match self {
            Error::Validation(msg)
            | Error::Overloaded(msg)
            | Error::ModelFailure(msg)
            | Error::Timeout(msg)
            | Error::Cancelled(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<EnvelopeError> for Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Io(io) => Error::Io(io),
            other => Error::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes() {
        assert_eq!(Error::validation("x").code(), ErrorCode::ValidationError);
        assert_eq!(Error::Overloaded("x".into()).code(), ErrorCode::Overloaded);
        assert_eq!(Error::not_found("job", "1").code(), ErrorCode::NotFound);
        assert_eq!(Error::Other("boom".into()).code(), ErrorCode::Internal);
        assert!(Error::Timeout("slow".into()).is_retryable());
        assert!(!Error::Cancelled("by caller".into()).is_retryable());
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = Error::Other("sqlite file locked at /var/lib".into());
        let wire = err.to_wire();
        assert_eq!(wire.code, ErrorCode::Internal);
        assert_eq!(wire.message, "internal error");

        let wire = Error::validation("text is empty").to_wire();
        assert_eq!(wire.message, "text is empty");
    }

    #[test]
    fn test_wire_round_trip_keeps_category() {
        let err = Error::from_wire(WireError::new(ErrorCode::Overloaded, "pool full"));
        assert!(matches!(err, Error::Overloaded(ref m) if m == "pool full"));
    }
}
