//! Computation handlers registered by the worker, and the built-in schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use volitas_core::{Clock, HandlerError, Job, JobKind, ScheduleEntry, ScheduleError};
use volitas_infra::dedup::DedupStore;
use volitas_infra::queue::JobQueue;
use volitas_infra::{HandlerRegistry, JobHandler, Settings};

use crate::app::AppServices;

pub const DEDUP_PURGE_TASK: &str = "dedup_purge";

/// Forwards a job to the analytics backend: `POST {base}/jobs/{kind}`.
///
/// A 4xx answer means the backend rejected the job itself and is not retried;
/// 5xx answers and transport errors are.
#[derive(Debug, Clone)]
pub struct HttpComputeHandler {
    client: reqwest::Client,
    base_url: String,
}

impl HttpComputeHandler {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, kind: &JobKind) -> String {
        format!("{}/jobs/{}", self.base_url, kind)
    }
}

#[async_trait]
impl JobHandler for HttpComputeHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let url = self.url_for(&job.kind);
        let body = json!({
            "kind": job.kind,
            "idempotency_key": job.idempotency_key,
            "payload": job.payload,
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("analytics backend unreachable: {e}")))?;

        let status = res.status();
        if status.is_success() {
            debug!(job_id = %job.id, %url, "analytics backend accepted job");
            return Ok(());
        }

        let detail = res.text().await.unwrap_or_default();
        let reason = format!("analytics backend answered {status}: {detail}");
        if status.is_client_error() {
            Err(HandlerError::non_retryable(reason))
        } else {
            Err(HandlerError::retryable(reason))
        }
    }
}

/// `default`-kind jobs: maintenance tasks selected by the payload's `task`.
pub struct HousekeepingHandler {
    dedup: Arc<dyn DedupStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    /// Succeeded queue rows older than this are deleted.
    retention: Duration,
}

impl HousekeepingHandler {
    pub fn new(dedup: Arc<dyn DedupStore>, queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            dedup,
            queue,
            clock,
            retention,
        }
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<(), HandlerError> {
        let expired = self
            .dedup
            .purge_expired(now)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let before = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let finished = self
            .queue
            .purge_succeeded(before)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        info!(dedup_records = expired, succeeded_jobs = finished, "housekeeping purge finished");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for HousekeepingHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        match job.payload.get("task").and_then(JsonValue::as_str) {
            Some(DEDUP_PURGE_TASK) => self.purge(self.clock.now()).await,
            Some(other) => Err(HandlerError::non_retryable(format!("unknown housekeeping task {other:?}"))),
            None => Err(HandlerError::non_retryable("housekeeping job without a task")),
        }
    }
}

/// Handlers for every routable kind: housekeeping for `default`, the
/// analytics backend for everything else.
pub fn registry(settings: &Settings, services: &AppServices) -> Result<HandlerRegistry, reqwest::Error> {
    let compute = Arc::new(HttpComputeHandler::new(
        settings.analytics_backend_url.clone(),
        settings.job_time_budget,
    )?);
    let housekeeping = Arc::new(HousekeepingHandler::new(
        services.stores.dedup.clone(),
        services.stores.queue.clone(),
        services.clock.clone(),
        settings.dedup_retention,
    ));

    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Default, housekeeping);
    for policy in services.table.queues() {
        for kind in services.table.kinds_for(&policy.name) {
            if registry.get(kind).is_none() {
                registry.register(kind.clone(), compute.clone());
            }
        }
    }
    Ok(registry)
}

/// Schedule entries every deployment runs, anchored at `anchor` on first
/// registration.
pub fn builtin_entries(settings: &Settings, anchor: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, ScheduleError> {
    Ok(vec![
        ScheduleEntry::new(
            "volume_tick",
            settings.volume_interval,
            JobKind::VolumeRecompute,
            json!({}),
            anchor,
        )?,
        ScheduleEntry::new(
            "correlation_tick",
            settings.correlation_interval,
            JobKind::CorrelationRecompute,
            json!({}),
            anchor,
        )?,
        ScheduleEntry::new(
            DEDUP_PURGE_TASK,
            settings.housekeeping_interval,
            JobKind::Default,
            json!({"task": DEDUP_PURGE_TASK}),
            anchor,
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use volitas_core::{IdempotencyKey, ManualClock};
    use volitas_infra::dedup::InMemoryDedupStore;
    use volitas_infra::queue::InMemoryJobQueue;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn builtin_entries_follow_settings() {
        let settings = Settings::from_map(&HashMap::from([(
            "MARKET_DATA_UPDATE_INTERVAL".to_string(),
            "30".to_string(),
        )]))
        .unwrap();
        let entries = builtin_entries(&settings, t(0)).unwrap();

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["volume_tick", "correlation_tick", "dedup_purge"]);
        assert_eq!(entries[0].interval, Duration::from_secs(30));
        assert_eq!(entries[1].interval, Duration::from_secs(300));
        for entry in &entries {
            assert!(settings.routing.route(&entry.job_kind).is_ok());
        }
    }

    #[test]
    fn registry_covers_every_routed_kind() {
        let settings = Settings::from_map(&HashMap::new()).unwrap();
        let services = AppServices::in_memory();
        let registry = registry(&settings, &services).unwrap();
        for kind in [JobKind::VolumeRecompute, JobKind::CorrelationRecompute, JobKind::Default] {
            assert!(registry.get(&kind).is_some(), "missing handler for {kind}");
        }
    }

    #[tokio::test]
    async fn housekeeping_purges_expired_dedup_records() {
        let clock = Arc::new(ManualClock::new(t(0)));
        let dedup = Arc::new(InMemoryDedupStore::new(Duration::from_secs(60)));
        dedup.record_success(&IdempotencyKey::new("old"), t(0)).await.unwrap();
        let handler = HousekeepingHandler::new(dedup.clone(), InMemoryJobQueue::arc(), clock.clone(), Duration::from_secs(60));

        clock.set(t(120));
        let job = Job::new(JobKind::Default, json!({"task": "dedup_purge"}), IdempotencyKey::new("purge"), t(120));
        handler.handle(&job).await.unwrap();
        assert!(!dedup.has_succeeded(&IdempotencyKey::new("old"), t(120)).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_housekeeping_task_is_terminal() {
        let clock = Arc::new(ManualClock::new(t(0)));
        let handler = HousekeepingHandler::new(
            Arc::new(InMemoryDedupStore::new(Duration::from_secs(60))),
            InMemoryJobQueue::arc(),
            clock,
            Duration::from_secs(60),
        );
        let job = Job::new(JobKind::Default, json!({"task": "vacuum"}), IdempotencyKey::new("k"), t(0));
        assert!(matches!(handler.handle(&job).await, Err(HandlerError::NonRetryable(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_retryable() {
        // Nothing listens on port 9 of localhost.
        let handler = HttpComputeHandler::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        let job = Job::new(JobKind::VolumeRecompute, json!({}), IdempotencyKey::new("k"), t(0));
        assert_eq!(handler.url_for(&job.kind), "http://127.0.0.1:9/jobs/volume_recompute");
        assert!(matches!(handler.handle(&job).await, Err(HandlerError::Retryable(_))));
    }
}
