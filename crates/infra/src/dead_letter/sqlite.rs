use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::instrument;

use volitas_core::{DeadLetterRecord, JobId};

use super::DeadLetterStore;
use crate::db::to_millis;
use crate::error::{StoreError, map_sqlx_error};

/// SQLite-backed dead letter store. Records are stored as JSON documents and
/// never updated.
#[derive(Debug, Clone)]
pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
}

impl SqliteDeadLetterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    #[instrument(skip(self, record), fields(job_id = %record.id()), err)]
    async fn append(&self, record: &DeadLetterRecord) -> Result<bool, StoreError> {
        let document = serde_json::to_string(record)?;
        let result = sqlx::query(
            "INSERT INTO dead_letters (job_id, record, recorded_at) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
        )
        .bind(record.id().to_string())
        .bind(document)
        .bind(to_millis(record.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let documents: Vec<String> =
            sqlx::query_scalar("SELECT record FROM dead_letters ORDER BY recorded_at ASC, job_id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<DeadLetterRecord>, StoreError> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT record FROM dead_letters WHERE job_id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        document
            .map(|doc| serde_json::from_str(&doc).map_err(StoreError::from))
            .transpose()
    }
}
