use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::ScheduleEntry;

use super::ScheduleStore;
use crate::error::StoreError;

/// In-memory schedule store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    entries: RwLock<BTreeMap<String, ScheduleEntry>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::poisoned("schedule"))?;
        match entries.get_mut(&entry.name) {
            Some(existing) => {
                existing.interval = entry.interval;
                existing.job_kind = entry.job_kind.clone();
                existing.payload_template = entry.payload_template.clone();
            }
            None => {
                entries.insert(entry.name.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned("schedule"))?;
        Ok(entries.values().cloned().collect())
    }

    async fn mark_fired(&self, name: &str, fire_time: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::poisoned("schedule"))?;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("schedule entry {name}")))?;

        if entry.last_fired_at.is_some_and(|last| last >= fire_time) {
            return Ok(false);
        }
        entry.last_fired_at = Some(fire_time);
        Ok(true)
    }
}
