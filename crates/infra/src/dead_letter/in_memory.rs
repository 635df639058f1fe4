use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use volitas_core::{DeadLetterRecord, JobId};

use super::DeadLetterStore;
use crate::error::StoreError;

/// In-memory dead letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, record: &DeadLetterRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned("dead letter"))?;
        if records.iter().any(|r| r.id() == record.id()) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned("dead letter"))?;
        Ok(records.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<DeadLetterRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned("dead letter"))?;
        Ok(records.iter().find(|r| r.id() == id).cloned())
    }
}
