//! Dedup store: idempotency keys of succeeded executions, kept for a bounded
//! retention window.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::IdempotencyKey;

use crate::error::StoreError;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryDedupStore;
pub use sqlite::SqliteDedupStore;

/// Seven days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether a success for `key` was recorded within the retention window.
    async fn has_succeeded(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record a success. Returns `false` if another writer recorded it first.
    async fn record_success(&self, key: &IdempotencyKey, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop records older than the retention window.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
