//! Named job queues.
//!
//! The queue owns a job from enqueue until it succeeds or is dead-lettered. A
//! worker slot owns it only between `claim` and the matching `ack`, `requeue`
//! or `remove`. Admission against `max_concurrency` happens inside `claim`,
//! so every process attached to a queue shares one limit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::{Job, JobId};

use crate::error::StoreError;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryJobQueue;
pub use sqlite::SqliteJobQueue;

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueReceipt {
    /// The job was added.
    Enqueued(JobId),
    /// A job with the same idempotency key is already pending or running on
    /// this queue; its id is returned and nothing was added.
    Duplicate(JobId),
}

impl EnqueueReceipt {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueReceipt::Enqueued(id) | EnqueueReceipt::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueReceipt::Duplicate(_))
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably add `job` to `queue`. Once this returns `Ok`, the job will be
    /// handed to some claim eventually.
    async fn enqueue(&self, queue: &str, job: Job) -> Result<EnqueueReceipt, StoreError>;

    /// Exclusively claim the oldest ready job of `queue`, provided fewer than
    /// `max_concurrency` jobs of that queue are running. The returned job is
    /// `running`.
    async fn claim(
        &self,
        queue: &str,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Mark a claimed job as succeeded. The row is kept for status queries.
    async fn ack(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Release a claim after a retryable failure, persisting the job's new
    /// `attempt_count`, `not_before`, status and history.
    async fn requeue(&self, job: &Job) -> Result<(), StoreError>;

    /// Drop a job from the queue (after it moved to the dead letter sink).
    async fn remove(&self, id: JobId) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs of `queue` waiting for a claim (pending or retry-scheduled).
    async fn backlog(&self, queue: &str) -> Result<usize, StoreError>;

    /// Jobs of `queue` currently running.
    async fn in_flight(&self, queue: &str) -> Result<usize, StoreError>;

    /// Return running jobs of `queue` claimed before `claimed_before` to
    /// pending. Their worker is presumed dead.
    async fn recover_stale(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Delete succeeded jobs finished before `before`.
    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}
