//! Schedule Store: durable schedule entries and their fire markers.
//!
//! `mark_fired` is a compare-and-set on `last_fired_at`. A fire only counts
//! once it completes; a crash between the beat's enqueue and `mark_fired`
//! leaves the entry due, and the re-enqueue carries the same tick key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::ScheduleEntry;

use crate::error::StoreError;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryScheduleStore;
pub use sqlite::SqliteScheduleStore;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Register or update an entry definition. An existing entry keeps its
    /// `anchor` and `last_fired_at`.
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    async fn entries(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    /// Entries whose next tick is at or before `now`, ordered by name.
    async fn get_due_entries(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut due: Vec<ScheduleEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(due)
    }

    /// Record that `name` fired for the tick at `fire_time`. Returns `false`
    /// when `last_fired_at` is already at or past `fire_time` (another writer
    /// won, or the tick was recorded before).
    async fn mark_fired(&self, name: &str, fire_time: DateTime<Utc>) -> Result<bool, StoreError>;
}
