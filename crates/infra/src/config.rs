//! Process configuration from environment variables (optionally seeded from a
//! `.env` file).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use volitas_core::{CatchUpPolicy, RetryPolicy, RoutingError, RoutingTable};

use crate::dedup::DEFAULT_RETENTION;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("failed to load routing file {path}: {message}")]
    RoutingFile { path: String, message: String },
    #[error("invalid routing table: {0}")]
    Routing(#[from] RoutingError),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    /// Leader lock backend. `None` means a process-local lock.
    pub redis_url: Option<String>,
    pub log_level: String,
    pub beat_wake_interval: Duration,
    pub volume_interval: Duration,
    pub correlation_interval: Duration,
    pub housekeeping_interval: Duration,
    pub catch_up: CatchUpPolicy,
    pub dedup_retention: Duration,
    pub job_time_budget: Duration,
    pub stale_claim_after: Duration,
    pub retry: RetryPolicy,
    pub routing: RoutingTable,
    pub analytics_backend_url: String,
    pub health_addr: SocketAddr,
    pub readiness_latency: Duration,
}

impl Settings {
    /// Read settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let job_time_budget = secs(&get, "JOB_TIME_BUDGET_SECS", 300)?;
        let stale_claim_after = match get("STALE_CLAIM_SECS") {
            Some(_) => secs(&get, "STALE_CLAIM_SECS", 600)?,
            None => job_time_budget * 2,
        };
        if stale_claim_after <= job_time_budget {
            return Err(ConfigError::Invalid {
                key: "STALE_CLAIM_SECS",
                message: "must exceed JOB_TIME_BUDGET_SECS".into(),
            });
        }

        let max_attempts: u32 = parse(&get, "MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_ATTEMPTS",
                message: "must be at least 1".into(),
            });
        }
        let retry = RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(parse(&get, "BACKOFF_BASE_MS", 500)?),
            secs(&get, "BACKOFF_MAX_SECS", 60)?,
        );

        let catch_up = match get("CATCH_UP_POLICY") {
            Some(raw) => raw.parse().map_err(|e: volitas_core::ScheduleError| ConfigError::Invalid {
                key: "CATCH_UP_POLICY",
                message: e.to_string(),
            })?,
            None => CatchUpPolicy::Latest,
        };

        let routing = match get("ROUTING_FILE") {
            Some(path) => load_routing_file(Path::new(&path))?,
            None => RoutingTable::default_topology(),
        };

        let health_addr = get("HEALTH_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let health_addr = SocketAddr::from_str(&health_addr).map_err(|e| ConfigError::Invalid {
            key: "HEALTH_ADDR",
            message: e.to_string(),
        })?;

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://volitas.db".to_string()),
            redis_url: redis_url(&get)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
            beat_wake_interval: secs(&get, "BEAT_WAKE_INTERVAL_SECS", 5)?,
            volume_interval: secs(&get, "MARKET_DATA_UPDATE_INTERVAL", 60)?,
            correlation_interval: secs(&get, "CORRELATION_INTERVAL_SECS", 300)?,
            housekeeping_interval: secs(&get, "HOUSEKEEPING_INTERVAL_SECS", 3600)?,
            catch_up,
            dedup_retention: secs(&get, "DEDUP_RETENTION_SECS", DEFAULT_RETENTION.as_secs())?,
            job_time_budget,
            stale_claim_after,
            retry,
            routing,
            analytics_backend_url: get("ANALYTICS_BACKEND_URL")
                .unwrap_or_else(|| "http://localhost:8001".to_string())
                .trim_end_matches('/')
                .to_string(),
            health_addr,
            readiness_latency: Duration::from_millis(parse(&get, "READINESS_LATENCY_MS", 500)?),
        })
    }
}

/// Load and validate a JSON routing table.
pub fn load_routing_file(path: &Path) -> Result<RoutingTable, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::RoutingFile {
        path: display.clone(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::RoutingFile {
        path: display,
        message: e.to_string(),
    })
}

/// `REDIS_URL` wins; otherwise `REDIS_HOST` (plus port, db, password) builds
/// `redis://[:password@]host:port/db`.
fn redis_url(get: &impl Fn(&str) -> Option<String>) -> Result<Option<String>, ConfigError> {
    if let Some(url) = get("REDIS_URL") {
        return Ok(Some(url));
    }
    let Some(host) = get("REDIS_HOST") else {
        return Ok(None);
    };
    let port: u16 = parse(get, "REDIS_PORT", 6379)?;
    let db: u32 = parse(get, "REDIS_DB", 0)?;
    let auth = get("REDIS_PASSWORD")
        .map(|password| format!(":{password}@"))
        .unwrap_or_default();
    Ok(Some(format!("redis://{auth}{host}:{port}/{db}")))
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

/// Positive number of seconds.
fn secs(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = parse(get, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(value))
}
