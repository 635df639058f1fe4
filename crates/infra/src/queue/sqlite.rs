//! SQLite-backed job queue shared by every process that opens the same database.
//!
//! Claims are a single `UPDATE ... RETURNING` statement: the candidate
//! selection and the running-count admission check execute under SQLite's
//! write lock, so two workers can never claim the same row or overshoot
//! `max_concurrency`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use volitas_core::{AttemptRecord, IdempotencyKey, Job, JobId, JobKind, JobStatus};

use super::{EnqueueReceipt, JobQueue};
use crate::db::{from_millis, to_millis};
use crate::error::{StoreError, map_sqlx_error};

const JOB_COLUMNS: &str = "id, kind, idempotency_key, payload, attempt_count, not_before, status, created_at, history";

#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn active_duplicate(&self, queue: &str, key: &IdempotencyKey) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE queue = ?1 AND idempotency_key = ?2
              AND status IN ('pending', 'running', 'failed_retryable')
            "#,
        )
        .bind(queue)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_duplicate", e))?;

        row.map(|r| parse_job_id(&r)).transpose()
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, idempotency_key = %job.idempotency_key), err)]
    async fn enqueue(&self, queue: &str, job: Job) -> Result<EnqueueReceipt, StoreError> {
        let payload = serde_json::to_string(&job.payload)?;
        let history = serde_json::to_string(&job.history)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, kind, idempotency_key, payload, attempt_count,
                not_before, status, created_at, claimed_at, finished_at, history
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id.to_string())
        .bind(queue)
        .bind(job.kind.as_str())
        .bind(job.idempotency_key.as_str())
        .bind(payload)
        .bind(i64::from(job.attempt_count))
        .bind(to_millis(job.not_before))
        .bind(job.status.as_str())
        .bind(to_millis(job.created_at))
        .bind(history)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(EnqueueReceipt::Enqueued(job.id));
        }

        match self.active_duplicate(queue, &job.idempotency_key).await? {
            Some(existing) => Ok(EnqueueReceipt::Duplicate(existing)),
            // The conflicting row finished between the insert and the lookup,
            // or the id itself collided.
            None => Err(StoreError::Conflict(format!(
                "enqueue of {} raced with a concurrent writer",
                job.id
            ))),
        }
    }

    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        queue: &str,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let limit = i64::try_from(max_concurrency).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            UPDATE jobs
               SET status = 'running', claimed_at = ?1
             WHERE id = (
                    SELECT id FROM jobs
                     WHERE queue = ?2
                       AND status IN ('pending', 'failed_retryable')
                       AND not_before <= ?1
                     ORDER BY not_before ASC, created_at ASC, id ASC
                     LIMIT 1
                   )
               AND (SELECT COUNT(*) FROM jobs WHERE queue = ?2 AND status = 'running') < ?3
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(to_millis(now))
            .bind(queue)
            .bind(limit)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn ack(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'succeeded', claimed_at = NULL, finished_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(to_millis(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ack", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("running job {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt_count), err)]
    async fn requeue(&self, job: &Job) -> Result<(), StoreError> {
        let status = if job.status.is_claimable() {
            job.status
        } else {
            JobStatus::FailedRetryable
        };
        let history = serde_json::to_string(&job.history)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = ?1, attempt_count = ?2, not_before = ?3, history = ?4, claimed_at = NULL
             WHERE id = ?5 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(job.attempt_count))
        .bind(to_millis(job.not_before))
        .bind(history)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("running job {}", job.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn backlog(&self, queue: &str) -> Result<usize, StoreError> {
        count(
            &self.pool,
            "backlog",
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status IN ('pending', 'failed_retryable')",
            queue,
        )
        .await
    }

    async fn in_flight(&self, queue: &str) -> Result<usize, StoreError> {
        count(
            &self.pool,
            "in_flight",
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = 'running'",
            queue,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', claimed_at = NULL
             WHERE queue = ?1 AND status = 'running' AND claimed_at < ?2
            "#,
        )
        .bind(queue)
        .bind(to_millis(claimed_before))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'succeeded' AND finished_at < ?1")
            .bind(to_millis(before))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_succeeded", e))?;

        Ok(result.rows_affected() as usize)
    }
}

async fn count(pool: &SqlitePool, operation: &str, sql: &str, queue: &str) -> Result<usize, StoreError> {
    let n: i64 = sqlx::query_scalar(sql)
        .bind(queue)
        .fetch_one(pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn parse_job_id(row: &SqliteRow) -> Result<JobId, StoreError> {
    let raw: String = row.try_get("id").map_err(|e| map_sqlx_error("decode id", e))?;
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("invalid job id {raw}: {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let decode = |e| map_sqlx_error("decode job row", e);

    let kind: String = row.try_get("kind").map_err(decode)?;
    let key: String = row.try_get("idempotency_key").map_err(decode)?;
    let payload: String = row.try_get("payload").map_err(decode)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(decode)?;
    let not_before: i64 = row.try_get("not_before").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let created_at: i64 = row.try_get("created_at").map_err(decode)?;
    let history: String = row.try_get("history").map_err(decode)?;

    Ok(Job {
        id: parse_job_id(row)?,
        kind: JobKind::from(kind),
        idempotency_key: IdempotencyKey::new(key),
        payload: serde_json::from_str(&payload)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::Serialization(format!("attempt_count out of range: {attempt_count}")))?,
        not_before: from_millis("not_before", not_before)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        created_at: from_millis("created_at", created_at)?,
        history: serde_json::from_str::<Vec<AttemptRecord>>(&history)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    async fn queue() -> SqliteJobQueue {
        SqliteJobQueue::new(connect_in_memory().await.unwrap())
    }

    fn job(key: &str, at: DateTime<Utc>) -> Job {
        Job::new(
            JobKind::VolumeRecompute,
            json!({"asset": "BTC", "bucket": key}),
            IdempotencyKey::new(key),
            at,
        )
    }

    #[tokio::test]
    async fn enqueue_claim_ack_round_trip() {
        let queue = queue().await;
        let original = job("vol:1", t(0));
        let receipt = queue.enqueue("volume_queue", original.clone()).await.unwrap();
        assert_eq!(receipt, EnqueueReceipt::Enqueued(original.id));

        let claimed = queue.claim("volume_queue", 1, t(1)).await.unwrap().unwrap();
        assert_eq!(claimed.id, original.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.payload, original.payload);
        assert_eq!(queue.in_flight("volume_queue").await.unwrap(), 1);

        queue.ack(claimed.id, t(2)).await.unwrap();
        let stored = queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(queue.in_flight("volume_queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_is_bounded_by_running_count() {
        let queue = queue().await;
        queue.enqueue("correlations", job("a", t(0))).await.unwrap();
        queue.enqueue("correlations", job("b", t(1))).await.unwrap();

        let first = queue.claim("correlations", 1, t(2)).await.unwrap().unwrap();
        assert_eq!(first.idempotency_key.as_str(), "a");
        assert!(queue.claim("correlations", 1, t(2)).await.unwrap().is_none());
        assert_eq!(queue.backlog("correlations").await.unwrap(), 1);

        let second = queue.claim("correlations", 2, t(2)).await.unwrap().unwrap();
        assert_eq!(second.idempotency_key.as_str(), "b");
    }

    #[tokio::test]
    async fn active_duplicate_is_not_inserted() {
        let queue = queue().await;
        let first = job("same", t(0));
        queue.enqueue("volume_queue", first.clone()).await.unwrap();

        let receipt = queue.enqueue("volume_queue", job("same", t(5))).await.unwrap();
        assert_eq!(receipt, EnqueueReceipt::Duplicate(first.id));

        // Once the first finished, the key may be enqueued again.
        let claimed = queue.claim("volume_queue", 1, t(6)).await.unwrap().unwrap();
        queue.ack(claimed.id, t(7)).await.unwrap();
        let receipt = queue.enqueue("volume_queue", job("same", t(8))).await.unwrap();
        assert!(!receipt.is_duplicate());
    }

    #[tokio::test]
    async fn requeue_persists_backoff_and_history() {
        let queue = queue().await;
        queue.enqueue("volume_queue", job("k", t(0))).await.unwrap();
        let mut claimed = queue.claim("volume_queue", 1, t(0)).await.unwrap().unwrap();

        claimed.record_failure(t(0), t(1), "upstream 503");
        claimed.schedule_retry(t(10));
        queue.requeue(&claimed).await.unwrap();

        assert!(queue.claim("volume_queue", 1, t(9)).await.unwrap().is_none());
        let again = queue.claim("volume_queue", 1, t(10)).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 1);
        assert_eq!(again.history.len(), 1);
        assert_eq!(again.last_failure(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn recover_and_purge() {
        let queue = queue().await;
        queue.enqueue("volitas", job("stale", t(0))).await.unwrap();
        queue.claim("volitas", 1, t(0)).await.unwrap().unwrap();
        assert_eq!(queue.recover_stale("volitas", t(60)).await.unwrap(), 1);

        let claimed = queue.claim("volitas", 1, t(61)).await.unwrap().unwrap();
        queue.ack(claimed.id, t(62)).await.unwrap();
        assert_eq!(queue.purge_succeeded(t(62)).await.unwrap(), 0);
        assert_eq!(queue.purge_succeeded(t(63)).await.unwrap(), 1);
        assert!(queue.get(claimed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn simultaneous_jobs_are_claimed_in_id_order() {
        let queue = queue().await;
        let jobs: Vec<Job> = (0..8).map(|i| job(&format!("j{i}"), t(0))).collect();
        for job in jobs.iter().rev() {
            queue.enqueue("correlations", job.clone()).await.unwrap();
        }

        for expected in &jobs {
            let claimed = queue.claim("correlations", 1, t(0)).await.unwrap().unwrap();
            assert_eq!(claimed.id, expected.id);
            queue.ack(claimed.id, t(0)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn late_ack_after_recovery_is_rejected() {
        let queue = queue().await;
        queue.enqueue("volitas", job("k", t(0))).await.unwrap();
        let claimed = queue.claim("volitas", 1, t(0)).await.unwrap().unwrap();
        assert_eq!(queue.recover_stale("volitas", t(60)).await.unwrap(), 1);

        assert!(matches!(queue.ack(claimed.id, t(61)).await, Err(StoreError::NotFound(_))));
        let stored = queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(queue.backlog("volitas").await.unwrap(), 1);
    }
}
