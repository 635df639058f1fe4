//! SQLite pool setup and schema.
//!
//! One database holds the queue, schedule entries, dedup records, dead
//! letters and the beat's leader lease. Worker and beat processes open the same file; WAL plus a busy
//! timeout lets them write concurrently without `SQLITE_BUSY` failures.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::instrument;

use crate::error::{StoreError, map_sqlx_error};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        queue            TEXT NOT NULL,
        kind             TEXT NOT NULL,
        idempotency_key  TEXT NOT NULL,
        payload          TEXT NOT NULL,
        attempt_count    INTEGER NOT NULL,
        not_before       INTEGER NOT NULL,
        status           TEXT NOT NULL,
        created_at       INTEGER NOT NULL,
        claimed_at       INTEGER NULL,
        finished_at      INTEGER NULL,
        history          TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_idx
        ON jobs (queue, status, not_before, created_at)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_active_key_idx
        ON jobs (queue, idempotency_key)
        WHERE status IN ('pending', 'running', 'failed_retryable')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedule_entries (
        name              TEXT PRIMARY KEY,
        interval_ms       INTEGER NOT NULL,
        job_kind          TEXT NOT NULL,
        payload_template  TEXT NOT NULL,
        anchor            INTEGER NOT NULL,
        last_fired_at     INTEGER NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dedup_records (
        idempotency_key  TEXT PRIMARY KEY,
        succeeded_at     INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leader_leases (
        name        TEXT PRIMARY KEY,
        holder      TEXT NOT NULL,
        expires_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        job_id       TEXT PRIMARY KEY,
        record       TEXT NOT NULL,
        recorded_at  INTEGER NOT NULL
    )
    "#,
];

/// Open a pool for `database_url` and make sure the schema exists.
#[instrument(err)]
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| map_sqlx_error("parse_database_url", e))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database. Every connection to `sqlite::memory:`
/// is a separate database, so the pool is capped at one.
pub async fn connect_in_memory() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| map_sqlx_error("connect_in_memory", e))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes (idempotent).
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
    }
    Ok(())
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("{column}: timestamp out of range: {millis}")))
}
