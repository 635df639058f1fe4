//! In-memory job queue for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use volitas_core::{Job, JobId, JobStatus};

use super::{EnqueueReceipt, JobQueue};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Slot {
    queue: String,
    job: Job,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Slot>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every job on `queue`, oldest first.
    pub fn jobs_in(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("queue"))?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|s| s.queue == queue)
            .map(|s| s.job.clone())
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, queue: &str, job: Job) -> Result<EnqueueReceipt, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;

        let existing = jobs.values().find(|s| {
            s.queue == queue
                && s.job.status.is_active()
                && s.job.idempotency_key == job.idempotency_key
        });
        if let Some(slot) = existing {
            return Ok(EnqueueReceipt::Duplicate(slot.job.id));
        }
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
        }

        let id = job.id;
        jobs.insert(
            id,
            Slot {
                queue: queue.to_string(),
                job,
                claimed_at: None,
                finished_at: None,
            },
        );
        Ok(EnqueueReceipt::Enqueued(id))
    }

    async fn claim(
        &self,
        queue: &str,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;

        let running = jobs
            .values()
            .filter(|s| s.queue == queue && s.job.status == JobStatus::Running)
            .count();
        if running >= max_concurrency {
            return Ok(None);
        }

        let next = jobs
            .values()
            .filter(|s| s.queue == queue && s.job.status.is_claimable() && s.job.is_ready(now))
            .min_by_key(|s| (s.job.not_before, s.job.created_at, s.job.id))
            .map(|s| s.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(slot) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        slot.job.status = JobStatus::Running;
        slot.claimed_at = Some(now);
        Ok(Some(slot.job.clone()))
    }

    async fn ack(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;
        let slot = jobs
            .get_mut(&id)
            .filter(|s| s.job.status == JobStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running job {id}")))?;
        slot.job.status = JobStatus::Succeeded;
        slot.claimed_at = None;
        slot.finished_at = Some(at);
        Ok(())
    }

    async fn requeue(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;
        let slot = jobs
            .get_mut(&job.id)
            .filter(|s| s.job.status == JobStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running job {}", job.id)))?;
        slot.job.attempt_count = job.attempt_count;
        slot.job.not_before = job.not_before;
        slot.job.history = job.history.clone();
        slot.job.status = if job.status.is_claimable() {
            job.status
        } else {
            JobStatus::FailedRetryable
        };
        slot.claimed_at = None;
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;
        jobs.remove(&id);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("queue"))?;
        Ok(jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn backlog(&self, queue: &str) -> Result<usize, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("queue"))?;
        Ok(jobs
            .values()
            .filter(|s| s.queue == queue && s.job.status.is_claimable())
            .count())
    }

    async fn in_flight(&self, queue: &str) -> Result<usize, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("queue"))?;
        Ok(jobs
            .values()
            .filter(|s| s.queue == queue && s.job.status == JobStatus::Running)
            .count())
    }

    async fn recover_stale(
        &self,
        queue: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;
        let mut recovered = 0;
        for slot in jobs.values_mut() {
            let stale = slot.queue == queue
                && slot.job.status == JobStatus::Running
                && slot.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                slot.job.status = JobStatus::Pending;
                slot.claimed_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("queue"))?;
        let len = jobs.len();
        jobs.retain(|_, s| {
            !(s.job.status == JobStatus::Succeeded && s.finished_at.is_some_and(|at| at < before))
        });
        Ok(len - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use volitas_core::{IdempotencyKey, JobKind};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn job(key: &str, at: DateTime<Utc>) -> Job {
        Job::new(JobKind::CorrelationRecompute, json!({}), IdempotencyKey::new(key), at)
    }

    #[tokio::test]
    async fn claim_respects_admission_count() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("correlations", job("a", t(0))).await.unwrap();
        queue.enqueue("correlations", job("b", t(1))).await.unwrap();

        let first = queue.claim("correlations", 1, t(2)).await.unwrap().unwrap();
        assert_eq!(first.idempotency_key.as_str(), "a");
        assert!(queue.claim("correlations", 1, t(2)).await.unwrap().is_none());

        queue.ack(first.id, t(3)).await.unwrap();
        let second = queue.claim("correlations", 1, t(3)).await.unwrap().unwrap();
        assert_eq!(second.idempotency_key.as_str(), "b");
    }

    #[tokio::test]
    async fn duplicate_active_key_returns_existing_id() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue("volitas", job("k", t(0))).await.unwrap();
        let again = queue.enqueue("volitas", job("k", t(1))).await.unwrap();

        assert_eq!(again, EnqueueReceipt::Duplicate(first.job_id()));
        assert_eq!(queue.backlog("volitas").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backoff_hides_job_until_not_before() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("volitas", job("k", t(0))).await.unwrap();
        let mut claimed = queue.claim("volitas", 1, t(0)).await.unwrap().unwrap();

        claimed.record_failure(t(0), t(1), "boom");
        claimed.schedule_retry(t(30));
        queue.requeue(&claimed).await.unwrap();

        assert!(queue.claim("volitas", 1, t(29)).await.unwrap().is_none());
        let again = queue.claim("volitas", 1, t(30)).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 1);
        assert_eq!(again.last_failure(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_claims_return_to_pending() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("volitas", job("k", t(0))).await.unwrap();
        let claimed = queue.claim("volitas", 1, t(0)).await.unwrap().unwrap();

        assert_eq!(queue.recover_stale("volitas", t(0)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale("volitas", t(10)).await.unwrap(), 1);

        let job = queue.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(queue.in_flight("volitas").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn simultaneous_jobs_are_claimed_in_id_order() {
        let queue = InMemoryJobQueue::new();
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
    async fn ack_requires_a_running_claim() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue("volitas", job("k", t(0))).await.unwrap();
        let claimed = queue.claim("volitas", 1, t(0)).await.unwrap().unwrap();
        queue.recover_stale("volitas", t(10)).await.unwrap();

        // The sweep took the claim back; a late ack must not finish the job.
        assert!(matches!(queue.ack(claimed.id, t(11)).await, Err(StoreError::NotFound(_))));
        assert_eq!(queue.get(claimed.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }
}
