//! Error taxonomy shared across component boundaries.
//!
//! Every failure is classified into one of these kinds before it crosses into
//! pool or scheduler logic; nothing travels as an unclassified error.

use thiserror::Error;

use crate::job::JobKind;

/// Failure of `route`/`enqueue` at the Queue Router boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No routing entry for the job kind. Configuration error: never retried.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(JobKind),

    /// Transport/storage failure while pushing the job. Transient.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl RouteError {
    /// Transient errors may be retried by the caller; configuration errors may not.
    pub fn is_transient(&self) -> bool {
        matches!(self, RouteError::QueueUnavailable(_))
    }
}

/// Error returned by a computation handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth another attempt (downstream hiccup, lock contention, ...).
    #[error("retryable handler error: {0}")]
    Retryable(String),

    /// Retrying cannot help (malformed payload, missing asset, ...).
    #[error("non-retryable handler error: {0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            HandlerError::Retryable(r) | HandlerError::NonRetryable(r) => r,
        }
    }
}

/// Invalid routing table (detected at load time, before any job is routed).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("job kind {kind} routes to undeclared queue {queue}")]
    UndeclaredQueue { kind: JobKind, queue: String },

    #[error("queue {0} declared more than once")]
    DuplicateQueue(String),

    #[error("queue {0} must allow at least one concurrent job")]
    ZeroConcurrency(String),

    #[error("queue name must not be empty")]
    EmptyQueueName,
}

/// Invalid schedule entry definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule entry {0} must have a non-zero interval")]
    ZeroInterval(String),

    #[error("schedule entry name must not be empty")]
    EmptyName,

    #[error("invalid catch-up policy: {0}")]
    InvalidCatchUpPolicy(String),
}
