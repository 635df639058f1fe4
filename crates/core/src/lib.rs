//! `volitas-core`: orchestration building blocks.
//!
//! This crate contains the **pure** data model of the job orchestration layer
//! (jobs, schedule entries, routing, retry policy). No IO, no runtime.

pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod routing;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::DeadLetterRecord;
pub use error::{HandlerError, RouteError, RoutingError, ScheduleError};
pub use id::JobId;
pub use job::{AttemptRecord, IdempotencyKey, Job, JobKind, JobStatus, Outcome};
pub use retry::{BackoffStrategy, RetryPolicy, jitter_seed};
pub use routing::{QueuePolicy, RoutingTable};
pub use schedule::{CatchUpPolicy, DueTicks, ScheduleEntry};
