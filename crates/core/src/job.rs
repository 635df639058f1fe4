//! Job model: the unit of work moved between beat, queue and worker pools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::id::JobId;

/// Job type. Determines routing (kind → queue) and handler selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    /// Volume aggregate recomputation.
    VolumeRecompute,
    /// Cross-asset correlation recomputation.
    CorrelationRecompute,
    /// Housekeeping and everything without a dedicated pool.
    Default,
    /// Any other kind name. Routable only if the routing table declares it.
    Custom(String),
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobKind::VolumeRecompute => "volume_recompute",
            JobKind::CorrelationRecompute => "correlation_recompute",
            JobKind::Default => "default",
            JobKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "volume_recompute" => JobKind::VolumeRecompute,
            "correlation_recompute" => JobKind::CorrelationRecompute,
            "default" => JobKind::Default,
            _ => JobKind::Custom(value),
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        match value {
            JobKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identity of a logical unit of work.
///
/// Two jobs with the same key are the same work: only one of them may run the
/// computation handler to success.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for ad hoc submissions without an explicit key: `kind:sha256(payload)`.
    ///
    /// Object keys are hashed in sorted order, so `{"a":1,"b":2}` and
    /// `{"b":2,"a":1}` collapse to the same key.
    pub fn derive(kind: &JobKind, payload: &JsonValue) -> Self {
        let mut canonical = String::new();
        write_canonical(payload, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();

        let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{}:{}", kind.as_str(), hex))
    }

    /// Key for one nominal tick of a schedule entry.
    ///
    /// Re-evaluating the same tick (e.g. after a crash between enqueue and
    /// `mark_fired`) yields the same key.
    pub fn for_tick(kind: &JobKind, entry: &str, tick: DateTime<Utc>) -> Self {
        Self(format!("{}:{}:{}", kind.as_str(), entry, tick.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, waiting for a claim.
    Pending,
    /// Claimed by exactly one worker slot.
    Running,
    /// Completed (or deduplicated against an earlier success).
    Succeeded,
    /// Failed, waiting for `not_before` before the next claim.
    FailedRetryable,
    /// Exhausted retries or failed terminally; lives in the dead letter sink.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::FailedRetryable => "failed_retryable",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }

    /// Statuses a worker slot may claim from (subject to `not_before`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::FailedRetryable)
    }

    /// Statuses that count as "the same work is already queued".
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::FailedRetryable
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed_retryable" => Ok(JobStatus::FailedRetryable),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// Record of one failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reason: String,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub idempotency_key: IdempotencyKey,
    /// Opaque input for the computation handler.
    pub payload: JsonValue,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    /// Not eligible for a claim before this instant (backoff).
    pub not_before: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Failure history across attempts.
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Create a pending job, eligible immediately.
    pub fn new(
        kind: JobKind,
        payload: JsonValue,
        idempotency_key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            idempotency_key,
            payload,
            attempt_count: 0,
            not_before: now,
            status: JobStatus::Pending,
            created_at: now,
            history: Vec::new(),
        }
    }

    /// Create a job for an ad hoc submission; derives the key when none is given.
    pub fn submitted(
        kind: JobKind,
        payload: JsonValue,
        idempotency_key: Option<IdempotencyKey>,
        now: DateTime<Utc>,
    ) -> Self {
        let key = idempotency_key.unwrap_or_else(|| IdempotencyKey::derive(&kind, &payload));
        Self::new(kind, payload, key, now)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    /// Append a failed attempt to the history and bump `attempt_count`.
    pub fn record_failure(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) {
        self.attempt_count += 1;
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            started_at,
            finished_at,
            reason: reason.into(),
        });
    }

    /// Put the job back in line after a retryable failure.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>) {
        self.not_before = not_before;
        self.status = JobStatus::FailedRetryable;
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.history.last().map(|a| a.reason.as_str())
    }

    /// Fresh copy for operator replay: new id, same kind/payload/key, attempts reset.
    pub fn replay(&self, now: DateTime<Utc>) -> Self {
        Self::new(
            self.kind.clone(),
            self.payload.clone(),
            self.idempotency_key.clone(),
            now,
        )
    }
}

/// Classified result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded, or an earlier success with the same key was found
    /// (`deduplicated`), in which case the handler was not invoked.
    Succeeded { deduplicated: bool },
    /// Worth retrying after backoff (handler error, timeout, store hiccup).
    FailedRetryable { reason: String },
    /// Must not be retried automatically; goes to the dead letter sink.
    FailedTerminal { reason: String },
}

impl Outcome {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded { .. } => None,
            Outcome::FailedRetryable { reason } | Outcome::FailedTerminal { reason } => {
                Some(reason)
            }
        }
    }
}
