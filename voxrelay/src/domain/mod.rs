//! Job, stage and batch data model.
//!
//! These types carry no scheduling behavior. The orchestrator owns [`Job`]s;
//! queues and pools refer to them by [`JobId`] only.

pub mod batch;
pub mod job;
pub mod stage;

pub use batch::{Batch, BatchResult, ItemResult, StageCompletion};
pub use job::{Job, JobId, JobKind, JobPayload, JobRequest, JobStatus, Priority};
pub use stage::{
    PoolKey, Stage, StageArtifacts, StageInput, StageOutput, StagePlan, StageRequest, Tier,
};
