//! Inbound submission and outbound status for the API collaborator.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use volitas_core::{Clock, IdempotencyKey, Job, JobId, JobKind, JobStatus, RouteError};

use crate::dead_letter::DeadLetterSink;
use crate::error::StoreError;
use crate::router::QueueRouter;

/// Status of a job as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt_count: u32,
    /// Last failure reason (for `dead` jobs, the final one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Clone)]
pub struct JobService {
    router: QueueRouter,
    dead_letters: DeadLetterSink,
    clock: Arc<dyn Clock>,
}

impl JobService {
    pub fn new(router: QueueRouter, dead_letters: DeadLetterSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            router,
            dead_letters,
            clock,
        }
    }

    /// Submit an ad hoc job. Without an explicit key, one is derived from
    /// kind and payload, so identical submissions collapse. A blank key
    /// counts as no key.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload: JsonValue,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<JobId, RouteError> {
        let idempotency_key = idempotency_key.filter(|key| !key.as_str().trim().is_empty());
        let job = Job::submitted(kind, payload, idempotency_key, self.clock.now());
        let receipt = self.router.enqueue(job).await?;
        info!(job_id = %receipt.job_id(), duplicate = receipt.is_duplicate(), "job submitted");
        Ok(receipt.job_id())
    }

    /// Current status, or `None` for an id neither queued nor dead-lettered.
    pub async fn status(&self, id: JobId) -> Result<Option<JobStatusView>, StoreError> {
        if let Some(job) = self.router.queue().get(id).await? {
            return Ok(Some(JobStatusView {
                job_id: id,
                status: job.status,
                attempt_count: job.attempt_count,
                last_failure: job.last_failure().map(str::to_string),
            }));
        }

        Ok(self.dead_letters.get(id).await?.map(|record| JobStatusView {
            job_id: id,
            status: JobStatus::Dead,
            attempt_count: record.job.attempt_count,
            last_failure: Some(record.reason),
        }))
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").field("router", &self.router).finish()
    }
}
