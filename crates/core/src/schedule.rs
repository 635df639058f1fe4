//! Periodic schedule entries and tick arithmetic.
//!
//! Ticks of an entry sit on the grid `anchor + k * interval` (k >= 0). The
//! schedule store persists `last_fired_at`, always a grid point, so the same
//! nominal tick is recomputed identically after a restart.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::ScheduleError;
use crate::job::{IdempotencyKey, Job, JobKind};

/// What to do with ticks missed while no beat was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CatchUpPolicy {
    /// Fire once, for the most recent due tick. Older missed ticks are dropped.
    #[default]
    Latest,
    /// Fire once per missed tick, keeping at most `max_ticks` of the most
    /// recent ones. Older missed ticks are dropped.
    Backfill { max_ticks: u32 },
}

impl FromStr for CatchUpPolicy {
    type Err = ScheduleError;

    /// Parses `latest` or `backfill:<max_ticks>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "latest" {
            return Ok(CatchUpPolicy::Latest);
        }
        if let Some(max) = s.strip_prefix("backfill:") {
            let max_ticks = max
                .parse::<u32>()
                .map_err(|_| ScheduleError::InvalidCatchUpPolicy(s.clone()))?;
            if max_ticks == 0 {
                return Err(ScheduleError::InvalidCatchUpPolicy(s));
            }
            return Ok(CatchUpPolicy::Backfill { max_ticks });
        }
        Err(ScheduleError::InvalidCatchUpPolicy(s))
    }
}

/// Ticks to fire for one entry in one beat cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DueTicks {
    /// Nominal fire times, ascending.
    pub ticks: Vec<DateTime<Utc>>,
    /// Missed ticks deliberately not fired (catch-up policy).
    pub dropped: u64,
}

/// A periodic task definition plus its persisted fire marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Unique name of the periodic task.
    pub name: String,
    pub interval: Duration,
    pub job_kind: JobKind,
    pub payload_template: JsonValue,
    /// First tick of the grid (registration time unless given explicitly).
    pub anchor: DateTime<Utc>,
    /// Nominal tick of the last recorded fire.
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        job_kind: JobKind,
        payload_template: JsonValue,
        anchor: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ScheduleError::EmptyName);
        }
        if interval.as_millis() == 0 {
            return Err(ScheduleError::ZeroInterval(name));
        }
        Ok(Self {
            name,
            interval,
            job_kind,
            payload_template,
            anchor,
            last_fired_at: None,
        })
    }

    fn interval_ms(&self) -> i64 {
        i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Nominal time of the next tick that has not been recorded yet.
    pub fn next_tick(&self) -> DateTime<Utc> {
        match self.last_fired_at {
            Some(last) => last + chrono::Duration::milliseconds(self.interval_ms()),
            None => self.anchor,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_tick() <= now
    }

    /// Nominal ticks to fire at `now` under `policy`.
    pub fn due_ticks(&self, now: DateTime<Utc>, policy: CatchUpPolicy) -> DueTicks {
        let first = self.next_tick();
        if first > now {
            return DueTicks::default();
        }

        let interval = self.interval_ms();
        let extra = (now - first).num_milliseconds() / interval;
        let total = extra.saturating_add(1);
        let latest = first + chrono::Duration::milliseconds(extra.saturating_mul(interval));

        let take = match policy {
            CatchUpPolicy::Latest => 1,
            CatchUpPolicy::Backfill { max_ticks } => total.min(i64::from(max_ticks.max(1))),
        };

        let ticks = (0..take)
            .rev()
            .map(|back| latest - chrono::Duration::milliseconds(back * interval))
            .collect();

        DueTicks {
            ticks,
            dropped: (total - take) as u64,
        }
    }

    /// Payload for the job fired at `tick`: the template plus the nominal fire time.
    pub fn payload_for(&self, tick: DateTime<Utc>) -> JsonValue {
        let mut payload = match &self.payload_template {
            JsonValue::Object(map) => JsonValue::Object(map.clone()),
            JsonValue::Null => json!({}),
            other => json!({ "params": other.clone() }),
        };
        if let JsonValue::Object(map) = &mut payload {
            map.insert("schedule_entry".to_string(), json!(self.name));
            map.insert("scheduled_for".to_string(), json!(tick.to_rfc3339()));
        }
        payload
    }

    /// The job for one nominal tick. Same tick, same idempotency key.
    pub fn job_for(&self, tick: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job::new(
            self.job_kind.clone(),
            self.payload_for(tick),
            IdempotencyKey::for_tick(&self.job_kind, &self.name, tick),
            now,
        )
    }
}
