//! Pipeline record persistence.

mod memory;
mod sqlite;

pub use memory::MemoryPipelineStore;
pub use sqlite::SqlitePipelineStore;

use async_trait::async_trait;

use super::record::PipelineRecord;
use crate::Result;
use crate::domain::JobId;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert or replace.
    async fn save(&self, record: &PipelineRecord) -> Result<()>;

    async fn load(&self, job_id: &JobId) -> Result<Option<PipelineRecord>>;

    async fn delete(&self, job_id: &JobId) -> Result<()>;

    /// Records to act on after a restart: unfinished jobs, and finished jobs
    /// whose terminal event was not confirmed delivered. Oldest first.
    async fn load_recoverable(&self) -> Result<Vec<PipelineRecord>>;
}
