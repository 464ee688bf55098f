//! Multi-stage job pipeline: records, persistence, retry policy and the
//! orchestrator that drives jobs through their stages.

pub mod events;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod store;

pub use events::JobEvent;
pub use orchestrator::{PipelineOrchestrator, RecoveryReport};
pub use record::{JobSnapshot, PipelineRecord};
pub use retry::RetryPolicy;
pub use store::{MemoryPipelineStore, PipelineStore, SqlitePipelineStore};
