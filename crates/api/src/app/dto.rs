use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use volitas_core::{DeadLetterRecord, JobId, JobKind};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    #[serde(default = "empty_payload")]
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
}

fn empty_payload() -> JsonValue {
    JsonValue::Object(Default::default())
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterSummary {
    pub job_id: JobId,
    pub kind: JobKind,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub reason: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl From<&DeadLetterRecord> for DeadLetterSummary {
    fn from(record: &DeadLetterRecord) -> Self {
        Self {
            job_id: record.id(),
            kind: record.job.kind.clone(),
            idempotency_key: record.job.idempotency_key.as_str().to_string(),
            attempt_count: record.job.attempt_count,
            reason: record.reason.clone(),
            recorded_at: record.recorded_at,
        }
    }
}
