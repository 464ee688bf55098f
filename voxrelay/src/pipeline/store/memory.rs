use async_trait::async_trait;
use dashmap::DashMap;

use super::PipelineStore;
use crate::Result;
use crate::domain::JobId;
use crate::pipeline::record::PipelineRecord;

/// Process-local store. Survives nothing, but keeps the orchestrator's
/// persistence path identical to the durable backend.
#[derive(Debug, Default)]
pub struct MemoryPipelineStore {
    records: DashMap<JobId, PipelineRecord>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn save(&self, record: &PipelineRecord) -> Result<()> {
        self.records.insert(record.job_id().clone(), record.clone());
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<PipelineRecord>> {
        Ok(self.records.get(job_id).map(|r| r.value().clone()))
    }

    async fn delete(&self, job_id: &JobId) -> Result<()> {
        self.records.remove(job_id);
        Ok(())
    }

    async fn load_recoverable(&self) -> Result<Vec<PipelineRecord>> {
        let mut records: Vec<PipelineRecord> = self
            .records
            .iter()
            .filter(|r| !r.is_terminal() || !r.terminal_delivered)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobPayload, JobRequest, JobStatus, Tier};

    fn record(text: &str) -> PipelineRecord {
        let request = JobRequest::new(JobPayload::Translation {
            text: text.into(),
            source_language: None,
            target_languages: vec!["pt".into()],
        });
        PipelineRecord::new(Job::from_request(request, &Tier::default()))
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemoryPipelineStore::new();
        let rec = record("a");
        store.save(&rec).await.unwrap();
        assert_eq!(
            store.load(rec.job_id()).await.unwrap().unwrap().job.payload,
            rec.job.payload
        );
        store.delete(rec.job_id()).await.unwrap();
        assert!(store.load(rec.job_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recoverable_filter() {
        let store = MemoryPipelineStore::new();

        let mut running = record("running");
        running.transition(JobStatus::Running).unwrap();
        let mut undelivered = record("undelivered");
        undelivered.transition(JobStatus::Failed).unwrap();
        let mut delivered = record("delivered");
        delivered.transition(JobStatus::Succeeded).unwrap();
        delivered.terminal_delivered = true;

        for rec in [&running, &undelivered, &delivered] {
            store.save(rec).await.unwrap();
        }

        let ids: Vec<JobId> = store
            .load_recoverable()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(running.job_id()));
        assert!(ids.contains(undelivered.job_id()));
    }
}
