//! Infrastructure layer: queues, schedule and dedup stores, workers, the beat
//! loop and configuration.

pub mod beat;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod health;
pub mod leader;
pub mod pool;
pub mod queue;
pub mod router;
pub mod schedule;
pub mod service;

#[cfg(test)]
mod testing;

pub use beat::{BeatConfig, BeatHandle, BeatScheduler, CycleReport};
pub use config::{ConfigError, Settings};
pub use dead_letter::{DeadLetterSink, DeadLetterStore};
pub use dedup::DedupStore;
pub use error::StoreError;
pub use executor::{HandlerRegistry, JobExecutor, JobHandler};
pub use health::{HealthReporter, PoolHealth};
pub use leader::LeaderLock;
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use queue::{EnqueueReceipt, JobQueue};
pub use router::QueueRouter;
pub use schedule::ScheduleStore;
pub use service::{JobService, JobStatusView};
