//! Leader lock for the beat: only the holder evaluates schedules.
//!
//! Leases expire after a TTL so a crashed leader is replaced; the holder
//! renews on every cycle. When the lock backend is unreachable nobody is
//! leader. Beats in different processes must share a backend: the SQLite
//! database or Redis. The in-memory lock only arbitrates within one process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use volitas_core::Clock;

use crate::db::to_millis;
use crate::error::{StoreError, map_sqlx_error};

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Acquire the lease for `holder`, or extend it if `holder` already owns
    /// it. Returns whether `holder` is leader for the next `ttl`.
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Give the lease up if `holder` owns it.
    async fn release(&self, holder: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Process-local leader lock: single-node deployments and tests.
pub struct InMemoryLeaderLock {
    lease: Mutex<Option<Lease>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaderLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            lease: Mutex::new(None),
            clock,
        }
    }

    pub fn holder(&self) -> Option<String> {
        let now = self.clock.now();
        self.lease
            .lock()
            .ok()
            .and_then(|lease| lease.clone())
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder)
    }
}

#[async_trait]
impl LeaderLock for InMemoryLeaderLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut lease = self.lease.lock().map_err(|_| StoreError::poisoned("leader"))?;

        let free = match lease.as_ref() {
            None => true,
            Some(current) => current.holder == holder || current.expires_at <= now,
        };
        if !free {
            return Ok(false);
        }
        *lease = Some(Lease {
            holder: holder.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        Ok(true)
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        let mut lease = self.lease.lock().map_err(|_| StoreError::poisoned("leader"))?;
        if lease.as_ref().is_some_and(|l| l.holder == holder) {
            *lease = None;
        }
        Ok(())
    }
}

/// Default lease name.
const DEFAULT_LEASE: &str = "beat";

/// Leader lease kept in the shared SQLite database, for deployments without
/// Redis. Every beat process opening the same file competes for one row.
#[derive(Clone)]
pub struct SqliteLeaderLock {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    name: String,
}

impl SqliteLeaderLock {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            name: DEFAULT_LEASE.to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl LeaderLock for SqliteLeaderLock {
    // The upsert only overwrites a row held by `holder` or already expired;
    // zero affected rows means someone else holds a live lease.
    #[instrument(skip(self), fields(lease = %self.name), err)]
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let result = sqlx::query(
            r#"
            INSERT INTO leader_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT (name) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE leader_leases.holder = excluded.holder OR leader_leases.expires_at <= ?4
            "#,
        )
        .bind(&self.name)
        .bind(holder)
        .bind(to_millis(expires_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("leader_try_acquire", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(lease = %self.name), err)]
    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM leader_leases WHERE name = ?1 AND holder = ?2")
            .bind(&self.name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("leader_release", e))?;
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_lock::RedisLeaderLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::instrument;

    use super::LeaderLock;
    use crate::error::StoreError;

    /// Default lease key.
    const DEFAULT_LOCK_KEY: &str = "volitas:beat:leader";

    // Extend the lease only if we still own it.
    const RENEW_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
    "#;

    const RELEASE_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
    "#;

    /// Leader lease stored in Redis (`SET key holder NX PX ttl`).
    #[derive(Debug, Clone)]
    pub struct RedisLeaderLock {
        client: redis::Client,
        key: String,
    }

    impl RedisLeaderLock {
        pub fn new(redis_url: impl AsRef<str>, key: Option<String>) -> Result<Self, StoreError> {
            let client = redis::Client::open(redis_url.as_ref())
                .map_err(|e| StoreError::Unavailable(format!("redis client: {e}")))?;
            Ok(Self {
                client,
                key: key.unwrap_or_else(|| DEFAULT_LOCK_KEY.to_string()),
            })
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis connection: {e}")))
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    #[async_trait]
    impl LeaderLock for RedisLeaderLock {
        #[instrument(skip(self), fields(key = %self.key), err)]
        async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
            let mut conn = self.connection().await?;
            let ttl_ms = ttl_millis(ttl);

            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(holder)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis SET: {e}")))?;
            if acquired.is_some() {
                return Ok(true);
            }

            let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
                .key(&self.key)
                .arg(holder)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis renew: {e}")))?;
            Ok(renewed == 1)
        }

        #[instrument(skip(self), fields(key = %self.key), err)]
        async fn release(&self, holder: &str) -> Result<(), StoreError> {
            let mut conn = self.connection().await?;
            let _: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&self.key)
                .arg(holder)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis release: {e}")))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use volitas_core::ManualClock;

    #[tokio::test]
    async fn one_holder_at_a_time_until_lease_expires() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let lock = InMemoryLeaderLock::new(clock.clone());
        let ttl = Duration::from_secs(30);

        assert!(lock.try_acquire("beat-a", ttl).await.unwrap());
        assert!(!lock.try_acquire("beat-b", ttl).await.unwrap());
        assert!(lock.try_acquire("beat-a", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert!(lock.try_acquire("beat-b", ttl).await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("beat-b"));
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lock = InMemoryLeaderLock::new(clock);
        let ttl = Duration::from_secs(30);

        lock.try_acquire("beat-a", ttl).await.unwrap();
        lock.release("beat-b").await.unwrap();
        assert_eq!(lock.holder().as_deref(), Some("beat-a"));

        lock.release("beat-a").await.unwrap();
        assert!(lock.try_acquire("beat-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn database_lease_is_shared_between_processes() {
        let (_dir, url) = crate::testing::file_database();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        // Two pools stand in for two beat processes opening the same file.
        let a = SqliteLeaderLock::new(crate::db::connect(&url).await.unwrap(), clock.clone());
        let b = SqliteLeaderLock::new(crate::db::connect(&url).await.unwrap(), clock.clone());
        let ttl = Duration::from_secs(30);

        assert!(a.try_acquire("beat-a", ttl).await.unwrap());
        assert!(!b.try_acquire("beat-b", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(20));
        assert!(a.try_acquire("beat-a", ttl).await.unwrap());

        // Renewed at +20s, so still held at +45s.
        clock.advance(chrono::Duration::seconds(25));
        assert!(!b.try_acquire("beat-b", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(6));
        assert!(b.try_acquire("beat-b", ttl).await.unwrap());
        assert!(!a.try_acquire("beat-a", ttl).await.unwrap());

        a.release("beat-a").await.unwrap();
        assert!(!a.try_acquire("beat-a", ttl).await.unwrap());
        b.release("beat-b").await.unwrap();
        assert!(a.try_acquire("beat-a", ttl).await.unwrap());
    }
}
