//! Dead letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::{AttemptRecord, Job, JobStatus};

/// Snapshot of a job at terminal failure. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The job as it was when it died (status `dead`, full attempt history).
    pub job: Job,
    /// Reason of the final failure.
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(mut job: Job, reason: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        job.status = JobStatus::Dead;
        Self {
            job,
            reason: reason.into(),
            recorded_at,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Attempt timestamps and failure reasons, oldest first.
    pub fn history(&self) -> &[AttemptRecord] {
        &self.job.history
    }
}
