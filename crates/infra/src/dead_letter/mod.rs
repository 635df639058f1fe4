//! Dead Letter Sink: append-only holding area for terminally failed jobs.
//!
//! Records are never reprocessed automatically. `requeue` is the operator's
//! explicit replay: a fresh copy of the job (new id, `attempt_count = 0`,
//! same idempotency key) goes back through the Queue Router. The record
//! itself stays untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use volitas_core::{Clock, DeadLetterRecord, Job, JobId, RouteError};

use crate::error::StoreError;
use crate::queue::EnqueueReceipt;
use crate::router::QueueRouter;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryDeadLetterStore;
pub use sqlite::SqliteDeadLetterStore;

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append `record`. Returns `false` if a record for the same job id exists
    /// already; the existing record is kept as written.
    async fn append(&self, record: &DeadLetterRecord) -> Result<bool, StoreError>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<DeadLetterRecord>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<DeadLetterRecord>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RequeueError {
    #[error("no dead letter record for job {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Clone)]
pub struct DeadLetterSink {
    store: Arc<dyn DeadLetterStore>,
    router: QueueRouter,
    clock: Arc<dyn Clock>,
}

impl DeadLetterSink {
    pub fn new(store: Arc<dyn DeadLetterStore>, router: QueueRouter, clock: Arc<dyn Clock>) -> Self {
        Self { store, router, clock }
    }

    /// Record `job` (with its failure history) as dead.
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt_count), err)]
    pub async fn record(&self, job: Job, reason: &str) -> Result<DeadLetterRecord, StoreError> {
        let record = DeadLetterRecord::new(job, reason, self.clock.now());
        if !self.store.append(&record).await? {
            warn!(job_id = %record.id(), "dead letter record already present; keeping original");
        }
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        self.store.list().await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<DeadLetterRecord>, StoreError> {
        self.store.get(id).await
    }

    /// Re-submit the dead job with `attempt_count` reset.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn requeue(&self, id: JobId) -> Result<EnqueueReceipt, RequeueError> {
        let record = self.store.get(id).await?.ok_or(RequeueError::NotFound(id))?;
        let replay = record.job.replay(self.clock.now());
        let replay_id = replay.id;

        let receipt = self.router.enqueue(replay).await?;
        info!(
            dead_job_id = %id,
            job_id = %receipt.job_id(),
            duplicate = receipt.job_id() != replay_id,
            "dead letter requeued"
        );
        Ok(receipt)
    }
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink").field("router", &self.router).finish()
    }
}
