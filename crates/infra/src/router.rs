//! Queue Router: job kind → queue via the static routing table, then enqueue.

use std::sync::Arc;

use tracing::{debug, instrument};

use volitas_core::{Job, QueuePolicy, RouteError, RoutingTable};

use crate::queue::{EnqueueReceipt, JobQueue};

#[derive(Clone)]
pub struct QueueRouter {
    table: Arc<RoutingTable>,
    queue: Arc<dyn JobQueue>,
}

impl QueueRouter {
    pub fn new(table: Arc<RoutingTable>, queue: Arc<dyn JobQueue>) -> Self {
        Self { table, queue }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Queue name for `job`. Pure lookup on `job.kind`.
    pub fn route(&self, job: &Job) -> Result<&str, RouteError> {
        self.policy_for(job).map(|policy| policy.name.as_str())
    }

    pub fn policy_for(&self, job: &Job) -> Result<&QueuePolicy, RouteError> {
        self.table.route(&job.kind)
    }

    /// Push `job` onto its queue. Transport failures surface as
    /// `QueueUnavailable`; the caller owns the retry policy.
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    pub async fn enqueue(&self, job: Job) -> Result<EnqueueReceipt, RouteError> {
        let queue = self.route(&job)?.to_string();
        let receipt = self.queue.enqueue(&queue, job).await?;
        debug!(queue = %queue, job_id = %receipt.job_id(), duplicate = receipt.is_duplicate(), "job enqueued");
        Ok(receipt)
    }
}

impl std::fmt::Debug for QueueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRouter").field("table", &self.table).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::testing::FlakyQueue;
    use chrono::Utc;
    use serde_json::json;
    use volitas_core::JobKind;

    fn job(kind: JobKind) -> Job {
        Job::submitted(kind, json!({"asset": "ETH"}), None, Utc::now())
    }

    #[tokio::test]
    async fn routes_by_kind_and_enqueues() {
        let queue = InMemoryJobQueue::arc();
        let router = QueueRouter::new(Arc::new(RoutingTable::default_topology()), queue.clone());

        let job = job(JobKind::CorrelationRecompute);
        assert_eq!(router.route(&job).unwrap(), "correlations");

        let receipt = router.enqueue(job).await.unwrap();
        assert_eq!(queue.backlog("correlations").await.unwrap(), 1);
        assert!(!receipt.is_duplicate());
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_before_enqueue() {
        let queue = InMemoryJobQueue::arc();
        let router = QueueRouter::new(Arc::new(RoutingTable::default_topology()), queue.clone());

        let err = router.enqueue(job(JobKind::custom("billing_sync"))).await.unwrap_err();
        assert!(matches!(err, RouteError::UnknownJobKind(_)));
        assert_eq!(queue.backlog("volitas").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_queue_unavailable() {
        let queue = FlakyQueue::arc();
        queue.set_down("volume_queue", true);
        let router = QueueRouter::new(Arc::new(RoutingTable::default_topology()), queue);

        let err = router.enqueue(job(JobKind::VolumeRecompute)).await.unwrap_err();
        assert!(matches!(err, RouteError::QueueUnavailable(_)));
        assert!(err.is_transient());
    }
}
