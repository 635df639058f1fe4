use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use volitas_core::{Clock, RoutingTable, SystemClock};
use volitas_infra::dead_letter::{DeadLetterSink, DeadLetterStore, InMemoryDeadLetterStore, SqliteDeadLetterStore};
use volitas_infra::dedup::{DEFAULT_RETENTION, DedupStore, InMemoryDedupStore, SqliteDedupStore};
use volitas_infra::leader::{InMemoryLeaderLock, LeaderLock, SqliteLeaderLock};
use volitas_infra::queue::{InMemoryJobQueue, JobQueue, SqliteJobQueue};
use volitas_infra::schedule::{InMemoryScheduleStore, ScheduleStore, SqliteScheduleStore};
use volitas_infra::{HealthReporter, JobService, QueueRouter, Settings, StoreError, db};

/// The persisted stores, behind their traits. `leader` is the beat's lease
/// when no Redis is configured.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn JobQueue>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub leader: Arc<dyn LeaderLock>,
}

impl Stores {
    pub fn sqlite(pool: SqlitePool, dedup_retention: Duration) -> Self {
        Self {
            queue: Arc::new(SqliteJobQueue::new(pool.clone())),
            schedule: Arc::new(SqliteScheduleStore::new(pool.clone())),
            dedup: Arc::new(SqliteDedupStore::with_retention(pool.clone(), dedup_retention)),
            dead_letters: Arc::new(SqliteDeadLetterStore::new(pool.clone())),
            leader: Arc::new(SqliteLeaderLock::new(pool, Arc::new(SystemClock))),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            queue: InMemoryJobQueue::arc(),
            schedule: InMemoryScheduleStore::arc(),
            dedup: Arc::new(InMemoryDedupStore::new(DEFAULT_RETENTION)),
            dead_letters: InMemoryDeadLetterStore::arc(),
            leader: Arc::new(InMemoryLeaderLock::new(Arc::new(SystemClock))),
        }
    }
}

/// Everything a subcommand or HTTP handler needs, wired once per process.
#[derive(Clone)]
pub struct AppServices {
    pub clock: Arc<dyn Clock>,
    pub table: Arc<RoutingTable>,
    pub stores: Stores,
    pub router: QueueRouter,
    pub dead_letters: DeadLetterSink,
    pub jobs: JobService,
    pub health: HealthReporter,
}

impl AppServices {
    pub fn new(table: Arc<RoutingTable>, stores: Stores, clock: Arc<dyn Clock>, readiness_latency: Duration) -> Self {
        let router = QueueRouter::new(table.clone(), stores.queue.clone());
        let dead_letters = DeadLetterSink::new(stores.dead_letters.clone(), router.clone(), clock.clone());
        let jobs = JobService::new(router.clone(), dead_letters.clone(), clock.clone());
        let health = HealthReporter::new(table.clone(), stores.queue.clone(), readiness_latency);
        Self {
            clock,
            table,
            stores,
            router,
            dead_letters,
            jobs,
            health,
        }
    }

    /// In-memory wiring with the default routing table.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(RoutingTable::default_topology()),
            Stores::in_memory(),
            Arc::new(SystemClock),
            Duration::from_millis(500),
        )
    }
}

/// Connect to the configured database and wire the SQLite-backed services.
pub async fn build_services(settings: &Settings) -> Result<AppServices, StoreError> {
    let pool = db::connect(&settings.database_url).await?;
    Ok(AppServices::new(
        Arc::new(settings.routing.clone()),
        Stores::sqlite(pool, settings.dedup_retention),
        Arc::new(SystemClock),
        settings.readiness_latency,
    ))
}
