//! Beat Scheduler: the single active loop that turns due schedule ticks into
//! jobs.
//!
//! Each cycle moves through `idle → evaluating → enqueuing → recording → idle`.
//! The leader lease is acquired (or renewed) before evaluation; standby
//! instances never read the schedule. A tick is enqueued first and recorded
//! second, so a crash in between re-enqueues the same tick on the next cycle
//! with the same idempotency key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use volitas_core::{CatchUpPolicy, Clock, JobId, RetryPolicy, RouteError, ScheduleEntry, jitter_seed};

use crate::error::StoreError;
use crate::leader::LeaderLock;
use crate::router::QueueRouter;
use crate::schedule::ScheduleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatPhase {
    Idle,
    Evaluating,
    Enqueuing,
    Recording,
}

#[derive(Debug, thiserror::Error)]
pub enum BeatError {
    #[error("schedule store unavailable: {0}")]
    ScheduleStoreUnavailable(#[source] StoreError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub wake_interval: Duration,
    pub catch_up: CatchUpPolicy,
    /// Identity used for the leader lease.
    pub holder_id: String,
    pub lock_ttl: Duration,
    /// Backoff applied per entry after a failed enqueue.
    pub enqueue_backoff: RetryPolicy,
}

impl Default for BeatConfig {
    fn default() -> Self {
        let wake_interval = Duration::from_secs(5);
        Self {
            wake_interval,
            catch_up: CatchUpPolicy::Latest,
            holder_id: format!("beat-{}", uuid::Uuid::now_v7()),
            lock_ttl: wake_interval * 6,
            enqueue_backoff: RetryPolicy::exponential(u32::MAX, wake_interval, Duration::from_secs(300)),
        }
    }
}

/// Why a cycle did not evaluate the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleSkip {
    NotLeader,
    LeaderLockUnavailable(String),
    ScheduleStoreUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTick {
    pub entry: String,
    pub tick: DateTime<Utc>,
    pub job_id: JobId,
    /// The queue already held an active job for this tick.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry: String,
    pub error: String,
}

/// Outcome of one beat cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub skipped: Option<CycleSkip>,
    pub fired: Vec<FiredTick>,
    /// Entries still in enqueue backoff.
    pub deferred: Vec<String>,
    pub failed: Vec<EntryFailure>,
    /// Missed ticks dropped by the catch-up policy.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy)]
struct EntryBackoff {
    failures: u32,
    retry_at: DateTime<Utc>,
}

pub struct BeatScheduler {
    store: Arc<dyn ScheduleStore>,
    router: QueueRouter,
    lock: Arc<dyn LeaderLock>,
    clock: Arc<dyn Clock>,
    config: BeatConfig,
    phase: Mutex<BeatPhase>,
    backoff: Mutex<HashMap<String, EntryBackoff>>,
}

impl BeatScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        router: QueueRouter,
        lock: Arc<dyn LeaderLock>,
        clock: Arc<dyn Clock>,
        config: BeatConfig,
    ) -> Self {
        Self {
            store,
            router,
            lock,
            clock,
            config,
            phase: Mutex::new(BeatPhase::Idle),
            backoff: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self) -> BeatPhase {
        self.phase.lock().map(|p| *p).unwrap_or(BeatPhase::Idle)
    }

    fn set_phase(&self, phase: BeatPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Register an entry. Its job kind must be routable.
    pub async fn register(&self, entry: &ScheduleEntry) -> Result<(), BeatError> {
        self.router.table().route(&entry.job_kind)?;
        self.store
            .upsert_entry(entry)
            .await
            .map_err(BeatError::ScheduleStoreUnavailable)?;
        info!(entry = %entry.name, kind = %entry.job_kind, interval_secs = entry.interval.as_secs_f64(), "schedule entry registered");
        Ok(())
    }

    /// Run one evaluation cycle at the clock's current time.
    pub async fn run_cycle(&self) -> CycleReport {
        let report = self.cycle().await;
        self.set_phase(BeatPhase::Idle);
        report
    }

    async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        self.set_phase(BeatPhase::Evaluating);
        let now = self.clock.now();

        match self.lock.try_acquire(&self.config.holder_id, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(holder = %self.config.holder_id, "not leader; standing by");
                report.skipped = Some(CycleSkip::NotLeader);
                return report;
            }
            Err(e) => {
                error!(holder = %self.config.holder_id, error = %e, "leader lock unavailable; standing by");
                report.skipped = Some(CycleSkip::LeaderLockUnavailable(e.to_string()));
                return report;
            }
        }

        let entries = match self.store.get_due_entries(now).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "schedule store unavailable; pausing evaluation");
                report.skipped = Some(CycleSkip::ScheduleStoreUnavailable(e.to_string()));
                return report;
            }
        };
        debug!(due = entries.len(), "beat cycle evaluated");

        for entry in entries {
            if let Some(retry_at) = self.backoff_until(&entry.name, now) {
                debug!(entry = %entry.name, retry_at = %retry_at, "entry in enqueue backoff");
                report.deferred.push(entry.name.clone());
                continue;
            }
            self.fire_entry(&entry, now, &mut report).await;
        }

        report
    }

    async fn fire_entry(&self, entry: &ScheduleEntry, now: DateTime<Utc>, report: &mut CycleReport) {
        let due = entry.due_ticks(now, self.config.catch_up);
        if due.dropped > 0 {
            info!(entry = %entry.name, dropped = due.dropped, "missed ticks dropped by catch-up policy");
        }
        report.dropped += due.dropped;

        for tick in due.ticks {
            self.set_phase(BeatPhase::Enqueuing);
            let job = entry.job_for(tick, now);
            let key = job.idempotency_key.clone();

            let receipt = match self.router.enqueue(job).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    let retry_at = self.record_enqueue_failure(&entry.name, now);
                    match &e {
                        RouteError::UnknownJobKind(_) => {
                            error!(entry = %entry.name, error = %e, "schedule entry is not routable")
                        }
                        RouteError::QueueUnavailable(_) => {
                            warn!(entry = %entry.name, error = %e, retry_at = %retry_at, "enqueue failed; backing off")
                        }
                    }
                    report.failed.push(EntryFailure {
                        entry: entry.name.clone(),
                        error: e.to_string(),
                    });
                    return;
                }
            };

            self.set_phase(BeatPhase::Recording);
            match self.store.mark_fired(&entry.name, tick).await {
                Ok(recorded) => {
                    if !recorded {
                        debug!(entry = %entry.name, tick = %tick, "tick already recorded");
                    }
                    info!(
                        entry = %entry.name,
                        tick = %tick,
                        job_id = %receipt.job_id(),
                        idempotency_key = %key,
                        duplicate = receipt.is_duplicate(),
                        "schedule entry fired"
                    );
                    report.fired.push(FiredTick {
                        entry: entry.name.clone(),
                        tick,
                        job_id: receipt.job_id(),
                        duplicate: receipt.is_duplicate(),
                    });
                }
                Err(e) => {
                    // The entry stays due; the next cycle re-enqueues with the same key.
                    error!(entry = %entry.name, tick = %tick, error = %e, "failed to record fire");
                    report.failed.push(EntryFailure {
                        entry: entry.name.clone(),
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
        self.clear_backoff(&entry.name);
    }

    fn backoff_until(&self, entry: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let backoff = self.backoff.lock().ok()?;
        backoff
            .get(entry)
            .map(|b| b.retry_at)
            .filter(|retry_at| *retry_at > now)
    }

    fn record_enqueue_failure(&self, entry: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let Ok(mut backoff) = self.backoff.lock() else {
            return now;
        };
        let failures = backoff.get(entry).map_or(0, |b| b.failures).saturating_add(1);
        let delay = self.config.enqueue_backoff.delay_for_attempt(failures, jitter_seed(entry));
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        backoff.insert(entry.to_string(), EntryBackoff { failures, retry_at });
        retry_at
    }

    fn clear_backoff(&self, entry: &str) {
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.remove(entry);
        }
    }

    /// Run cycles every `wake_interval` in the background until shutdown.
    pub fn spawn(self: Arc<Self>) -> BeatHandle {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(beat_loop(self, shutdown.clone()));
        BeatHandle {
            shutdown,
            join: Some(join),
        }
    }
}

impl std::fmt::Debug for BeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatScheduler")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

async fn beat_loop(beat: Arc<BeatScheduler>, shutdown: Arc<Notify>) {
    info!(holder = %beat.config.holder_id, wake_secs = beat.config.wake_interval.as_secs_f64(), "beat scheduler started");

    let mut interval = tokio::time::interval(beat.config.wake_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => {
                let report = beat.run_cycle().await;
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), fired = report.fired.len(), "beat cycle finished with failures");
                }
            }
        }
    }

    if let Err(e) = beat.lock.release(&beat.config.holder_id).await {
        warn!(error = %e, "failed to release leader lock");
    }
    info!(holder = %beat.config.holder_id, "beat scheduler stopped");
}

/// Handle to control a running beat.
#[derive(Debug)]
pub struct BeatHandle {
    shutdown: Arc<Notify>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl BeatHandle {
    /// Stop after the current cycle and release the leader lease.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::InMemoryLeaderLock;
    use crate::testing::{FlakyQueue, FlakyScheduleStore, t};
    use serde_json::json;
    use volitas_core::{JobKind, ManualClock, RoutingTable};

    struct Fixture {
        beat: BeatScheduler,
        store: Arc<FlakyScheduleStore>,
        queue: Arc<FlakyQueue>,
        clock: Arc<ManualClock>,
        lock: Arc<InMemoryLeaderLock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t(0)));
        let store = FlakyScheduleStore::arc();
        let queue = FlakyQueue::arc();
        let lock = Arc::new(InMemoryLeaderLock::new(clock.clone()));
        let router = QueueRouter::new(Arc::new(RoutingTable::default_topology()), queue.clone());
        let config = BeatConfig {
            holder_id: "beat-test".into(),
            enqueue_backoff: RetryPolicy::exponential(u32::MAX, Duration::from_secs(5), Duration::from_secs(300))
                .with_jitter(0.0),
            ..BeatConfig::default()
        };
        let beat = BeatScheduler::new(store.clone(), router, lock.clone(), clock.clone(), config);
        Fixture {
            beat,
            store,
            queue,
            clock,
            lock,
        }
    }

    fn entry(name: &str, kind: JobKind, secs: u64) -> ScheduleEntry {
        ScheduleEntry::new(name, Duration::from_secs(secs), kind, json!({}), t(0)).unwrap()
    }

    #[tokio::test]
    async fn standby_instance_does_not_evaluate() {
        let f = fixture();
        f.beat.register(&entry("volume_tick", JobKind::VolumeRecompute, 60)).await.unwrap();
        f.lock.try_acquire("other-beat", Duration::from_secs(30)).await.unwrap();

        let report = f.beat.run_cycle().await;
        assert_eq!(report.skipped, Some(CycleSkip::NotLeader));
        assert!(f.queue.jobs_in("volume_queue").is_empty());
        assert_eq!(f.beat.phase(), BeatPhase::Idle);
    }

    #[tokio::test]
    async fn store_outage_pauses_cycle_without_failing() {
        let f = fixture();
        f.beat.register(&entry("volume_tick", JobKind::VolumeRecompute, 60)).await.unwrap();
        f.store.set_down(true);

        let report = f.beat.run_cycle().await;
        assert!(matches!(report.skipped, Some(CycleSkip::ScheduleStoreUnavailable(_))));

        f.store.set_down(false);
        let report = f.beat.run_cycle().await;
        assert_eq!(report.fired.len(), 1);
    }

    #[tokio::test]
    async fn queue_outage_backs_off_one_entry_only() {
        let f = fixture();
        f.beat.register(&entry("volume_tick", JobKind::VolumeRecompute, 60)).await.unwrap();
        f.beat.register(&entry("correlation_tick", JobKind::CorrelationRecompute, 60)).await.unwrap();
        f.queue.set_down("volume_queue", true);

        let report = f.beat.run_cycle().await;
        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.fired[0].entry, "correlation_tick");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].entry, "volume_tick");

        // Within the backoff window the entry is deferred, not retried.
        f.queue.set_down("volume_queue", false);
        f.clock.set(t(4));
        let report = f.beat.run_cycle().await;
        assert_eq!(report.deferred, vec!["volume_tick".to_string()]);
        assert!(report.fired.is_empty());

        f.clock.set(t(5));
        let report = f.beat.run_cycle().await;
        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.fired[0].tick, t(0));
        assert_eq!(f.queue.jobs_in("volume_queue").len(), 1);
    }

    #[tokio::test]
    async fn unroutable_entry_is_rejected_at_registration() {
        let f = fixture();
        let err = f
            .beat
            .register(&entry("report", JobKind::custom("report_export"), 60))
            .await
            .unwrap_err();
        assert!(matches!(err, BeatError::Route(RouteError::UnknownJobKind(_))));
    }
}
