//! SQLite-backed schedule store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use volitas_core::{JobKind, ScheduleEntry};

use super::ScheduleStore;
use crate::db::{from_millis, to_millis};
use crate::error::{StoreError, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    #[instrument(skip(self, entry), fields(entry = %entry.name), err)]
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let interval_ms = i64::try_from(entry.interval.as_millis())
            .map_err(|_| StoreError::Serialization(format!("interval of {} too large", entry.name)))?;
        let template = serde_json::to_string(&entry.payload_template)?;

        sqlx::query(
            r#"
            INSERT INTO schedule_entries (name, interval_ms, job_kind, payload_template, anchor, last_fired_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (name) DO UPDATE SET
                interval_ms = excluded.interval_ms,
                job_kind = excluded.job_kind,
                payload_template = excluded.payload_template
            "#,
        )
        .bind(&entry.name)
        .bind(interval_ms)
        .bind(entry.job_kind.as_str())
        .bind(template)
        .bind(to_millis(entry.anchor))
        .bind(entry.last_fired_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_entry", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn entries(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, interval_ms, job_kind, payload_template, anchor, last_fired_at
            FROM schedule_entries
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_fired(&self, name: &str, fire_time: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_entries
               SET last_fired_at = ?2
             WHERE name = ?1 AND (last_fired_at IS NULL OR last_fired_at < ?2)
            "#,
        )
        .bind(name)
        .bind(to_millis(fire_time))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_fired", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM schedule_entries WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_fired", e))?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("schedule entry {name}"))),
        }
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<ScheduleEntry, StoreError> {
    let decode = |e| map_sqlx_error("decode schedule row", e);

    let interval_ms: i64 = row.try_get("interval_ms").map_err(decode)?;
    let job_kind: String = row.try_get("job_kind").map_err(decode)?;
    let template: String = row.try_get("payload_template").map_err(decode)?;
    let anchor: i64 = row.try_get("anchor").map_err(decode)?;
    let last_fired_at: Option<i64> = row.try_get("last_fired_at").map_err(decode)?;

    Ok(ScheduleEntry {
        name: row.try_get("name").map_err(decode)?,
        interval: Duration::from_millis(u64::try_from(interval_ms).unwrap_or(1).max(1)),
        job_kind: JobKind::from(job_kind),
        payload_template: serde_json::from_str(&template)?,
        anchor: from_millis("anchor", anchor)?,
        last_fired_at: last_fired_at
            .map(|ms| from_millis("last_fired_at", ms))
            .transpose()?,
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

    fn volume_tick() -> ScheduleEntry {
        ScheduleEntry::new(
            "volume_tick",
            Duration::from_secs(60),
            JobKind::VolumeRecompute,
            json!({"window": "1m"}),
            t(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn entries_survive_reopen_of_store() {
        let pool = connect_in_memory().await.unwrap();
        SqliteScheduleStore::new(pool.clone())
            .upsert_entry(&volume_tick())
            .await
            .unwrap();
        SqliteScheduleStore::new(pool.clone())
            .mark_fired("volume_tick", t(0))
            .await
            .unwrap();

        let reopened = SqliteScheduleStore::new(pool);
        let entries = reopened.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_fired_at, Some(t(0)));
        assert_eq!(entries[0].interval, Duration::from_secs(60));
        assert_eq!(entries[0].job_kind, JobKind::VolumeRecompute);
        assert_eq!(entries[0].payload_template, json!({"window": "1m"}));
    }

    #[tokio::test]
    async fn mark_fired_is_compare_and_set() {
        let store = SqliteScheduleStore::new(connect_in_memory().await.unwrap());
        store.upsert_entry(&volume_tick()).await.unwrap();

        assert!(store.mark_fired("volume_tick", t(0)).await.unwrap());
        assert!(!store.mark_fired("volume_tick", t(0)).await.unwrap());
        assert!(store.mark_fired("volume_tick", t(60)).await.unwrap());
        assert!(matches!(
            store.mark_fired("nope", t(60)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_entries_follow_fire_marker() {
        let store = SqliteScheduleStore::new(connect_in_memory().await.unwrap());
        store.upsert_entry(&volume_tick()).await.unwrap();

        assert_eq!(store.get_due_entries(t(0)).await.unwrap().len(), 1);
        store.mark_fired("volume_tick", t(0)).await.unwrap();
        assert!(store.get_due_entries(t(59)).await.unwrap().is_empty());
        assert_eq!(store.get_due_entries(t(61)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_does_not_reset_marker() {
        let store = SqliteScheduleStore::new(connect_in_memory().await.unwrap());
        store.upsert_entry(&volume_tick()).await.unwrap();
        store.mark_fired("volume_tick", t(120)).await.unwrap();

        let mut redefined = volume_tick();
        redefined.anchor = t(999);
        store.upsert_entry(&redefined).await.unwrap();

        let stored = store.entries().await.unwrap().remove(0);
        assert_eq!(stored.last_fired_at, Some(t(120)));
        assert_eq!(stored.anchor, t(0));
    }
}
