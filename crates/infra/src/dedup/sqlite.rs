use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use volitas_core::IdempotencyKey;

use super::{DEFAULT_RETENTION, DedupStore, retention_cutoff};
use crate::db::to_millis;
use crate::error::{StoreError, map_sqlx_error};

/// SQLite-backed dedup store. The primary key on `idempotency_key` makes
/// `record_success` a single-winner insert.
#[derive(Debug, Clone)]
pub struct SqliteDedupStore {
    pool: SqlitePool,
    retention: Duration,
}

impl SqliteDedupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retention(pool, DEFAULT_RETENTION)
    }

    pub fn with_retention(pool: SqlitePool, retention: Duration) -> Self {
        Self { pool, retention }
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    #[instrument(skip(self), fields(idempotency_key = %key), err)]
    async fn has_succeeded(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let cutoff = to_millis(retention_cutoff(now, self.retention));
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM dedup_records WHERE idempotency_key = ?1 AND succeeded_at >= ?2",
        )
        .bind(key.as_str())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_succeeded", e))?;

        Ok(found.is_some())
    }

    #[instrument(skip(self), fields(idempotency_key = %key), err)]
    async fn record_success(&self, key: &IdempotencyKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let cutoff = to_millis(retention_cutoff(at, self.retention));
        // An expired record for the same key is replaced rather than kept.
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_records (idempotency_key, succeeded_at)
            VALUES (?1, ?2)
            ON CONFLICT (idempotency_key) DO UPDATE SET succeeded_at = excluded.succeeded_at
            WHERE dedup_records.succeeded_at < ?3
            "#,
        )
        .bind(key.as_str())
        .bind(to_millis(at))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_success", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = to_millis(retention_cutoff(now, self.retention));
        let result = sqlx::query("DELETE FROM dedup_records WHERE succeeded_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;

        Ok(result.rows_affected() as usize)
    }
}
