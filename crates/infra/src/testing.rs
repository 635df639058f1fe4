//! Test doubles and fixtures shared by unit and scenario tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use volitas_core::{Job, JobId, ScheduleEntry};

use crate::error::StoreError;
use crate::queue::{EnqueueReceipt, InMemoryJobQueue, JobQueue};
use crate::schedule::{InMemoryScheduleStore, ScheduleStore};

/// `t(0)` is 2026-01-01T00:00:00Z.
pub(crate) fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// URL of a fresh database file. The file is removed when the guard drops.
pub(crate) fn file_database() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("volitas.db").display());
    (dir, url)
}

/// In-memory queue whose individual queues can be taken offline.
#[derive(Default)]
pub(crate) struct FlakyQueue {
    inner: InMemoryJobQueue,
    down: Mutex<HashSet<String>>,
}

impl FlakyQueue {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_down(&self, queue: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(queue.to_string());
        } else {
            set.remove(queue);
        }
    }

    pub(crate) fn jobs_in(&self, queue: &str) -> Vec<Job> {
        self.inner.jobs_in(queue).unwrap()
    }

    fn check(&self, queue: &str) -> Result<(), StoreError> {
        if self.down.lock().unwrap().contains(queue) {
            return Err(StoreError::Unavailable(format!("queue {queue} unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, queue: &str, job: Job) -> Result<EnqueueReceipt, StoreError> {
        self.check(queue)?;
        self.inner.enqueue(queue, job).await
    }

    async fn claim(
        &self,
        queue: &str,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.check(queue)?;
        self.inner.claim(queue, max_concurrency, now).await
    }

    async fn ack(&self, id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.ack(id, at).await
    }

    async fn requeue(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.requeue(job).await
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.remove(id).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn backlog(&self, queue: &str) -> Result<usize, StoreError> {
        self.check(queue)?;
        self.inner.backlog(queue).await
    }

    async fn in_flight(&self, queue: &str) -> Result<usize, StoreError> {
        self.check(queue)?;
        self.inner.in_flight(queue).await
    }

    async fn recover_stale(&self, queue: &str, claimed_before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.recover_stale(queue, claimed_before).await
    }

    async fn purge_succeeded(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.purge_succeeded(before).await
    }
}

/// Schedule store that can be switched off, or made to fail only on
/// `mark_fired` (a crash between enqueue and recording).
#[derive(Default)]
pub(crate) struct FlakyScheduleStore {
    inner: InMemoryScheduleStore,
    down: AtomicBool,
    fail_mark_fired: AtomicBool,
}

impl FlakyScheduleStore {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn fail_mark_fired(&self, fail: bool) {
        self.fail_mark_fired.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("schedule store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for FlakyScheduleStore {
    async fn upsert_entry(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert_entry(entry).await
    }

    async fn entries(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.check()?;
        self.inner.entries().await
    }

    async fn mark_fired(&self, name: &str, fire_time: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check()?;
        if self.fail_mark_fired.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("crashed before recording".into()));
        }
        self.inner.mark_fired(name, fire_time).await
    }
}
