use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::IdempotencyKey;

use super::{DEFAULT_RETENTION, DedupStore, retention_cutoff};
use crate::error::StoreError;

/// In-memory dedup store for tests/dev.
#[derive(Debug)]
pub struct InMemoryDedupStore {
    records: RwLock<HashMap<IdempotencyKey, DateTime<Utc>>>,
    retention: Duration,
}

impl InMemoryDedupStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn has_succeeded(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned("dedup"))?;
        let cutoff = retention_cutoff(now, self.retention);
        Ok(records.get(key).is_some_and(|at| *at >= cutoff))
    }

    async fn record_success(&self, key: &IdempotencyKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("dedup"))?;
        let cutoff = retention_cutoff(at, self.retention);
        match records.get(key) {
            Some(existing) if *existing >= cutoff => Ok(false),
            _ => {
                records.insert(key.clone(), at);
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("dedup"))?;
        let cutoff = retention_cutoff(now, self.retention);
        let before = records.len();
        records.retain(|_, at| *at >= cutoff);
        Ok(before - records.len())
    }
}
