//! Job Executor: one attempt of one job.
//!
//! Order of operations: dedup check, handler lookup, handler run under the
//! time budget, success recorded in the dedup store before `Succeeded` is
//! returned. Every failure leaves here already classified as an [`Outcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use volitas_core::{Clock, HandlerError, Job, JobKind, Outcome};

use crate::dedup::DedupStore;

/// Default per-attempt time budget (five minutes).
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(300);

/// Computation handler for one job kind.
///
/// Handlers must be safe to skip on replay: the same idempotency key always
/// stands for the same result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self.0)(job)
    }
}

/// Handler lookup by job kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Register a synchronous closure for `kind`.
    pub fn register_fn<F>(&mut self, kind: JobKind, handler: F) -> &mut Self
    where
        F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(FnHandler(handler)))
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

pub struct JobExecutor {
    registry: HandlerRegistry,
    dedup: Arc<dyn DedupStore>,
    clock: Arc<dyn Clock>,
    time_budget: Duration,
}

impl JobExecutor {
    pub fn new(registry: HandlerRegistry, dedup: Arc<dyn DedupStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            dedup,
            clock,
            time_budget: DEFAULT_TIME_BUDGET,
        }
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }

    /// Run one attempt of `job` and classify the result.
    pub async fn execute(&self, job: &Job) -> Outcome {
        match self.dedup.has_succeeded(&job.idempotency_key, self.clock.now()).await {
            Ok(true) => {
                debug!(job_id = %job.id, idempotency_key = %job.idempotency_key, "already succeeded; skipping handler");
                return Outcome::Succeeded { deduplicated: true };
            }
            Ok(false) => {}
            Err(e) => {
                return Outcome::FailedRetryable {
                    reason: format!("dedup check failed: {e}"),
                };
            }
        }

        let Some(handler) = self.registry.get(&job.kind) else {
            return Outcome::FailedTerminal {
                reason: format!("no handler registered for job kind {}", job.kind),
            };
        };

        if let Some(outcome) = self.run_handler(handler, job).await {
            return outcome;
        }

        match self.dedup.record_success(&job.idempotency_key, self.clock.now()).await {
            Ok(_) => Outcome::Succeeded { deduplicated: false },
            Err(e) => Outcome::FailedRetryable {
                reason: format!("recording success failed: {e}"),
            },
        }
    }

    /// `None` when the handler succeeded, otherwise the failure outcome.
    async fn run_handler(&self, handler: Arc<dyn JobHandler>, job: &Job) -> Option<Outcome> {
        let owned = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });

        match tokio::time::timeout(self.time_budget, &mut task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(HandlerError::Retryable(reason)))) => Some(Outcome::FailedRetryable { reason }),
            Ok(Ok(Err(HandlerError::NonRetryable(reason)))) => Some(Outcome::FailedTerminal { reason }),
            Ok(Err(join_err)) => {
                warn!(job_id = %job.id, error = %join_err, "handler task failed");
                Some(Outcome::FailedRetryable {
                    reason: format!("handler task failed: {join_err}"),
                })
            }
            Err(_) => {
                task.abort();
                warn!(job_id = %job.id, budget_secs = self.time_budget.as_secs_f64(), "handler timed out");
                Some(Outcome::FailedRetryable {
                    reason: format!("handler timed out after {:?}", self.time_budget),
                })
            }
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .field("time_budget", &self.time_budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryDedupStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use volitas_core::{IdempotencyKey, SystemClock};

    fn job(kind: JobKind, key: &str) -> Job {
        Job::new(kind, json!({"asset": "BTC"}), IdempotencyKey::new(key), chrono::Utc::now())
    }

    fn executor(registry: HandlerRegistry) -> (JobExecutor, Arc<InMemoryDedupStore>) {
        let dedup = InMemoryDedupStore::arc();
        (
            JobExecutor::new(registry, dedup.clone(), Arc::new(SystemClock)),
            dedup,
        )
    }

    #[tokio::test]
    async fn success_is_recorded_and_second_run_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::VolumeRecompute, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (executor, dedup) = executor(registry);

        let first = job(JobKind::VolumeRecompute, "vol:btc:1");
        assert_eq!(executor.execute(&first).await, Outcome::Succeeded { deduplicated: false });
        assert!(dedup.has_succeeded(&first.idempotency_key, chrono::Utc::now()).await.unwrap());

        let replay = job(JobKind::VolumeRecompute, "vol:btc:1");
        assert_eq!(executor.execute(&replay).await, Outcome::Succeeded { deduplicated: true });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_are_classified() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(JobKind::VolumeRecompute, |_| Err(HandlerError::retryable("db busy")))
            .register_fn(JobKind::CorrelationRecompute, |_| {
                Err(HandlerError::non_retryable("malformed payload"))
            });
        let (executor, dedup) = executor(registry);

        let retry = job(JobKind::VolumeRecompute, "a");
        assert_eq!(
            executor.execute(&retry).await,
            Outcome::FailedRetryable { reason: "db busy".into() }
        );
        let terminal = job(JobKind::CorrelationRecompute, "b");
        assert_eq!(
            executor.execute(&terminal).await,
            Outcome::FailedTerminal { reason: "malformed payload".into() }
        );
        assert!(!dedup.has_succeeded(&retry.idempotency_key, chrono::Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_handler_is_terminal() {
        let (executor, _) = executor(HandlerRegistry::new());
        let outcome = executor.execute(&job(JobKind::Default, "x")).await;
        assert!(matches!(outcome, Outcome::FailedTerminal { .. }));
    }

    struct Sleepy;

    #[async_trait]
    impl JobHandler for Sleepy {
        async fn handle(&self, _: &Job) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_over_budget_is_retryable_timeout() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobKind::CorrelationRecompute, Arc::new(Sleepy));
        let (executor, dedup) = executor(registry);
        let executor = executor.with_time_budget(Duration::from_secs(5));

        let job = job(JobKind::CorrelationRecompute, "slow");
        let outcome = executor.execute(&job).await;
        assert!(matches!(outcome, Outcome::FailedRetryable { ref reason } if reason.contains("timed out")));
        assert!(!dedup.has_succeeded(&job.idempotency_key, chrono::Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn panicking_handler_is_retryable() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobKind::Default, |_| panic!("handler bug"));
        let (executor, _) = executor(registry);

        let outcome = executor.execute(&job(JobKind::Default, "p")).await;
        assert!(matches!(outcome, Outcome::FailedRetryable { .. }));
    }
}
