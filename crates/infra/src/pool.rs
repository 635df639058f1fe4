//! Worker Pool Manager: bounded execution slots for one queue.
//!
//! Two limits apply to every claim. The local semaphore caps the slots of
//! this process; the queue's admission count (inside `JobQueue::claim`) caps
//! the whole queue across every process attached to it. A slot is released
//! only after the attempt is settled (acked, requeued or dead-lettered).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use volitas_core::{Clock, Job, Outcome, QueuePolicy, RetryPolicy};

use crate::dead_letter::DeadLetterSink;
use crate::error::StoreError;
use crate::executor::JobExecutor;
use crate::queue::JobQueue;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub queue: String,
    pub max_concurrency: usize,
    /// How often to poll for new jobs when idle.
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Running jobs claimed longer ago than this are returned to pending.
    pub stale_claim_after: Duration,
    /// Polls between two stale-claim sweeps.
    pub sweep_every: u32,
}

impl WorkerPoolConfig {
    pub fn for_queue(policy: &QueuePolicy) -> Self {
        Self {
            queue: policy.name.clone(),
            max_concurrency: policy.max_concurrency.max(1),
            poll_interval: Duration::from_millis(500),
            retry_policy: RetryPolicy::default(),
            stale_claim_after: Duration::from_secs(600),
            sweep_every: 120,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = after;
        self
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued { not_before: DateTime<Utc> },
    DeadLettered { reason: String },
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_deduplicated: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub settle_failures: u64,
    pub stale_recovered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    executor: Arc<JobExecutor>,
    dead_letters: DeadLetterSink,
    clock: Arc<dyn Clock>,
    slots: Arc<Semaphore>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        executor: Arc<JobExecutor>,
        dead_letters: DeadLetterSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            queue,
            executor,
            dead_letters,
            clock,
            slots,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Claim one job if a local slot is free and the queue admits it.
    pub async fn claim(&self) -> Result<Option<(OwnedSemaphorePermit, Job)>, StoreError> {
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Ok(None);
        };
        let claimed = self
            .queue
            .claim(&self.config.queue, self.config.max_concurrency, self.clock.now())
            .await?;
        Ok(claimed.map(|job| (permit, job)))
    }

    /// Claim every job the free slots and the queue admit and start one
    /// attempt per job on `running`. Returns how many were started.
    pub async fn dispatch(&self, running: &mut JoinSet<Result<Settlement, StoreError>>) -> Result<usize, StoreError> {
        let mut started = 0;
        while let Some((permit, job)) = self.claim().await? {
            debug!(queue = %self.config.queue, job_id = %job.id, kind = %job.kind, "claimed job");
            let pool = self.clone();
            running.spawn(async move {
                let settlement = pool.process(job).await;
                drop(permit);
                settlement
            });
            started += 1;
        }
        Ok(started)
    }

    /// One dispatch round, then wait for every started attempt. Returns the
    /// settlements in completion order, or the first settle error once all
    /// attempts have finished.
    pub async fn run_once(&self) -> Result<Vec<Settlement>, StoreError> {
        let mut running = JoinSet::new();
        let dispatched = self.dispatch(&mut running).await;

        let mut settled = Vec::with_capacity(running.len());
        let mut first_error = dispatched.err();
        while let Some(joined) = running.join_next().await {
            let result = joined.map_err(|e| StoreError::Unavailable(format!("settle task failed: {e}")));
            match result.and_then(|settlement| settlement) {
                Ok(settlement) => settled.push(settlement),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(settled),
        }
    }

    /// Execute a claimed job and settle the outcome with the queue.
    pub async fn process(&self, mut job: Job) -> Result<Settlement, StoreError> {
        self.update_stats(|s| s.current_running += 1);
        let started = self.clock.now();
        debug!(queue = %self.config.queue, job_id = %job.id, kind = %job.kind, attempt = job.attempt_count + 1, "executing job");

        let outcome = self.executor.execute(&job).await;
        let finished = self.clock.now();

        let result = match outcome {
            Outcome::Succeeded { deduplicated } => {
                self.queue.ack(job.id, finished).await.map(|()| {
                    self.update_stats(|s| {
                        s.jobs_succeeded += 1;
                        if deduplicated {
                            s.jobs_deduplicated += 1;
                        }
                    });
                    Settlement::Acked
                })
            }
            Outcome::FailedRetryable { reason } => {
                job.record_failure(started, finished, &reason);
                if self.config.retry_policy.should_retry(job.attempt_count) {
                    self.requeue(job, finished, &reason).await
                } else {
                    let reason = format!(
                        "retries exhausted after {} attempts: {reason}",
                        job.attempt_count
                    );
                    self.dead_letter(job, reason).await
                }
            }
            Outcome::FailedTerminal { reason } => {
                job.record_failure(started, finished, &reason);
                self.dead_letter(job, reason).await
            }
        };

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            if result.is_err() {
                s.settle_failures += 1;
            }
        });
        if let Err(e) = &result {
            // The claim stays in place; the stale sweep hands the job out again.
            error!(queue = %self.config.queue, error = %e, "failed to settle job");
        }
        result
    }

    async fn requeue(
        &self,
        mut job: Job,
        finished: DateTime<Utc>,
        reason: &str,
    ) -> Result<Settlement, StoreError> {
        let seed = job.id.as_uuid().as_u128() as u64;
        let delay = self.config.retry_policy.delay_for_attempt(job.attempt_count, seed);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let mut not_before = finished.checked_add_signed(delay).unwrap_or(finished);
        if not_before <= job.not_before {
            not_before = job.not_before + chrono::Duration::milliseconds(1);
        }
        job.schedule_retry(not_before);

        self.queue.requeue(&job).await?;
        self.update_stats(|s| s.jobs_retried += 1);
        warn!(
            queue = %self.config.queue,
            job_id = %job.id,
            attempt = job.attempt_count,
            not_before = %not_before,
            error = %reason,
            "job failed; retry scheduled"
        );
        Ok(Settlement::Requeued { not_before })
    }

    async fn dead_letter(&self, job: Job, reason: String) -> Result<Settlement, StoreError> {
        let id = job.id;
        let attempts = job.attempt_count;
        self.dead_letters.record(job, &reason).await?;
        self.queue.remove(id).await?;
        self.update_stats(|s| s.jobs_dead_lettered += 1);
        warn!(queue = %self.config.queue, job_id = %id, attempt = attempts, error = %reason, "job dead-lettered");
        Ok(Settlement::DeadLettered { reason })
    }

    /// Return claims older than `stale_claim_after` to pending.
    pub async fn sweep_stale(&self) -> Result<usize, StoreError> {
        let after = chrono::Duration::from_std(self.config.stale_claim_after).unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recovered = self.queue.recover_stale(&self.config.queue, cutoff).await?;
        if recovered > 0 {
            warn!(queue = %self.config.queue, recovered, "stale claims returned to pending");
            self.update_stats(|s| s.stale_recovered += recovered as u64);
        }
        Ok(recovered)
    }

    fn update_stats(&self, f: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Run the claim loop in the background until shutdown.
    pub fn spawn(self) -> WorkerPoolHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = self.stats.clone();
        let join = tokio::spawn(pool_loop(self, shutdown.clone()));
        WorkerPoolHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("config", &self.config).finish()
    }
}

async fn pool_loop(pool: WorkerPool, shutdown: Arc<Notify>) {
    let queue = pool.config.queue.clone();
    info!(queue = %queue, max_concurrency = pool.config.max_concurrency, "worker pool started");
    let start_time = Instant::now();

    let mut interval = tokio::time::interval(pool.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut polls: u32 = 0;
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => {}
        }

        if polls % pool.config.sweep_every.max(1) == 0 {
            if let Err(e) = pool.sweep_stale().await {
                error!(queue = %queue, error = %e, "stale claim sweep failed");
            }
        }
        polls = polls.wrapping_add(1);
        pool.update_stats(|s| s.uptime_secs = start_time.elapsed().as_secs());

        while running.try_join_next().is_some() {}
        if let Err(e) = pool.dispatch(&mut running).await {
            error!(queue = %queue, error = %e, "failed to claim job");
        }
    }

    // Let in-flight attempts settle before reporting stopped.
    while running.join_next().await.is_some() {}
    info!(queue = %queue, "worker pool stopped");
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<Notify>,
    join: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to settle.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::InMemoryDeadLetterStore;
    use crate::dedup::InMemoryDedupStore;
    use crate::executor::HandlerRegistry;
    use crate::queue::InMemoryJobQueue;
    use crate::router::QueueRouter;
    use chrono::TimeZone;
    use serde_json::json;
    use volitas_core::{HandlerError, IdempotencyKey, JobKind, JobStatus, ManualClock, RoutingTable};

    struct Fixture {
        pool: WorkerPool,
        queue: Arc<InMemoryJobQueue>,
        dead_letters: DeadLetterSink,
        clock: Arc<ManualClock>,
    }

    fn fixture(registry: HandlerRegistry, retry: RetryPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let queue = InMemoryJobQueue::arc();
        let table = Arc::new(RoutingTable::default_topology());
        let router = QueueRouter::new(table.clone(), queue.clone());
        let dead_letters = DeadLetterSink::new(InMemoryDeadLetterStore::arc(), router, clock.clone());
        let executor = Arc::new(JobExecutor::new(registry, InMemoryDedupStore::arc(), clock.clone()));
        let config = WorkerPoolConfig::for_queue(table.queue("volume_queue").unwrap()).with_retry_policy(retry);
        let pool = WorkerPool::new(config, queue.clone(), executor, dead_letters.clone(), clock.clone());
        Fixture {
            pool,
            queue,
            dead_letters,
            clock,
        }
    }

    fn volume_job(key: &str, at: DateTime<Utc>) -> Job {
        Job::new(JobKind::VolumeRecompute, json!({}), IdempotencyKey::new(key), at)
    }

    #[tokio::test]
    async fn success_acks_job() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, |_| Ok(()));
        let f = fixture(registry, RetryPolicy::default());

        let job = volume_job("ok", f.clock.now());
        f.queue.enqueue("volume_queue", job.clone()).await.unwrap();

        assert_eq!(f.pool.run_once().await.unwrap(), vec![Settlement::Acked]);
        assert_eq!(f.queue.get(job.id).await.unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(f.pool.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_die() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, |_| Err(HandlerError::retryable("analytics db down")));
        let retry = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.0);
        let f = fixture(registry, retry);

        let job = volume_job("flaky", f.clock.now());
        f.queue.enqueue("volume_queue", job.clone()).await.unwrap();

        let mut previous = job.not_before;
        for attempt in 1..=2u32 {
            let settled = f.pool.run_once().await.unwrap();
            let [Settlement::Requeued { not_before }] = settled.as_slice() else {
                panic!("expected requeue, got {settled:?}");
            };
            assert!(*not_before > previous);
            previous = *not_before;

            let stored = f.queue.get(job.id).await.unwrap().unwrap();
            assert_eq!(stored.attempt_count, attempt);
            assert_eq!(stored.status, JobStatus::FailedRetryable);

            // Not claimable before the backoff expires.
            assert!(f.pool.run_once().await.unwrap().is_empty());
            f.clock.set(*not_before);
        }

        let settled = f.pool.run_once().await.unwrap();
        assert!(matches!(settled.as_slice(), [Settlement::DeadLettered { .. }]));
        assert!(f.queue.get(job.id).await.unwrap().is_none());

        let record = f.dead_letters.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.job.attempt_count, 3);
        assert_eq!(record.history().len(), 3);
    }

    #[tokio::test]
    async fn non_retryable_goes_straight_to_dead_letters() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, |_| Err(HandlerError::non_retryable("unknown asset")));
        let f = fixture(registry, RetryPolicy::default());

        let job = volume_job("bad", f.clock.now());
        f.queue.enqueue("volume_queue", job.clone()).await.unwrap();
        f.pool.run_once().await.unwrap();

        let record = f.dead_letters.get(job.id).await.unwrap().unwrap();
        assert_eq!(record.job.attempt_count, 1);
        assert_eq!(record.reason, "unknown asset");
        assert_eq!(f.queue.backlog("volume_queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_slots_bound_claims() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, |_| Ok(()));
        let f = fixture(registry, RetryPolicy::default());
        f.queue.enqueue("volume_queue", volume_job("a", f.clock.now())).await.unwrap();
        f.queue.enqueue("volume_queue", volume_job("b", f.clock.now())).await.unwrap();

        let (_permit, first) = f.pool.claim().await.unwrap().unwrap();
        assert_eq!(first.idempotency_key.as_str(), "a");
        assert!(f.pool.claim().await.unwrap().is_none());
        assert_eq!(f.queue.in_flight("volume_queue").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn spawned_pool_drains_queue_and_shuts_down() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, |_| Ok(()));
        let f = fixture(registry, RetryPolicy::default());
        for key in ["a", "b", "c"] {
            f.queue.enqueue("volume_queue", volume_job(key, f.clock.now())).await.unwrap();
        }

        let config = f.pool.config().clone().with_poll_interval(Duration::from_millis(5));
        let pool = WorkerPool { config, ..f.pool.clone() };
        let handle = pool.spawn();

        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().jobs_succeeded, 3);
        handle.shutdown().await;
        assert_eq!(f.queue.backlog("volume_queue").await.unwrap(), 0);
    }

    /// Removes the "vanishing" job from under its own claim so its ack
    /// fails; every other job takes a while to finish.
    struct VanishingJob {
        queue: Arc<InMemoryJobQueue>,
    }

    #[async_trait::async_trait]
    impl crate::executor::JobHandler for VanishingJob {
        async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
            if job.idempotency_key.as_str() == "vanishing" {
                self.queue.remove(job.id).await.map_err(|e| HandlerError::retryable(e.to_string()))?;
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn settle_failure_does_not_abort_sibling_attempts() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let queue = InMemoryJobQueue::arc();
        let table = Arc::new(RoutingTable::default_topology());
        let router = QueueRouter::new(table.clone(), queue.clone());
        let dead_letters = DeadLetterSink::new(InMemoryDeadLetterStore::arc(), router, clock.clone());
        let mut registry = HandlerRegistry::new();
        registry.register(JobKind::VolumeRecompute, Arc::new(VanishingJob { queue: queue.clone() }));
        let executor = Arc::new(JobExecutor::new(registry, InMemoryDedupStore::arc(), clock.clone()));
        let config = WorkerPoolConfig {
            max_concurrency: 2,
            ..WorkerPoolConfig::for_queue(table.queue("volume_queue").unwrap())
        };
        let pool = WorkerPool::new(config, queue.clone(), executor, dead_letters, clock.clone());

        let slow = volume_job("slow", clock.now());
        queue.enqueue("volume_queue", slow.clone()).await.unwrap();
        queue.enqueue("volume_queue", volume_job("vanishing", clock.now())).await.unwrap();

        assert!(matches!(pool.run_once().await, Err(StoreError::NotFound(_))));
        assert_eq!(queue.get(slow.id).await.unwrap().unwrap().status, JobStatus::Succeeded);
        assert_eq!(pool.stats().jobs_succeeded, 1);
        assert_eq!(pool.stats().settle_failures, 1);
    }
}
