use async_trait::async_trait;
use sqlx::Row;

use super::PipelineStore;
use crate::Result;
use crate::database::DbPool;
use crate::domain::JobId;
use crate::pipeline::record::PipelineRecord;

/// SQLite-backed store. The full record is kept as JSON; status, stage and
/// delivery flag are duplicated into columns for the recovery query.
#[derive(Clone)]
pub struct SqlitePipelineStore {
    pool: DbPool,
}

impl SqlitePipelineStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for SqlitePipelineStore {
    async fn save(&self, record: &PipelineRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_records
                (job_id, status, stage, attempt, terminal_delivered, record, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                attempt = excluded.attempt,
                terminal_delivered = excluded.terminal_delivered,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.job_id().as_str())
        .bind(record.status().as_str())
        .bind(record.job.stage.as_str())
        .bind(record.attempt as i64)
        .bind(record.terminal_delivered)
        .bind(json)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query("SELECT record FROM pipeline_records WHERE job_id = ?")
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, job_id: &JobId) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_records WHERE job_id = ?")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_recoverable(&self) -> Result<Vec<PipelineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM pipeline_records
            WHERE status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')
               OR terminal_delivered = 0
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let json: String = row.try_get("record")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}
