//! Boundary to the model backends.
//!
//! A [`ModelInstance`] is a blocking, non-reentrant handle. `invoke` takes
//! `&mut self`, so one instance can only ever run one batch at a time; the
//! pool moves the owning worker onto a blocking thread for the call.

pub mod scripted;

pub use scripted::{ScriptedModelFactory, ScriptedStep};

use relay_envelope::{ErrorCode, WireError};
use thiserror::Error;

use crate::domain::{PoolKey, StageInput, StageOutput};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call timed out")]
    Timeout,
    #[error("model failure: {0}")]
    Failure(String),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

impl ModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ModelError::Timeout => ErrorCode::Timeout,
            ModelError::Failure(_) => ErrorCode::ModelFailure,
            ModelError::InvalidInput(_) => ErrorCode::ValidationError,
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError::new(self.code(), self.to_string())
    }
}

impl From<ModelError> for crate::Error {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Timeout => crate::Error::Timeout(err.to_string()),
            ModelError::Failure(msg) => crate::Error::ModelFailure(msg),
            ModelError::InvalidInput(msg) => crate::Error::Validation(msg),
        }
    }
}

/// One loaded model. Must return one output per input, in order.
pub trait ModelInstance: Send {
    fn invoke(&mut self, inputs: &[StageInput]) -> Result<Vec<StageOutput>, ModelError>;
}

/// Creates model instances for a pool. Called on a blocking thread.
pub trait ModelFactory: Send + Sync + 'static {
    fn create(&self, key: &PoolKey) -> Result<Box<dyn ModelInstance>, ModelError>;
}
