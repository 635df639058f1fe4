//! Subcommand implementations. Errors surface as `anyhow` with context.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::info;

use volitas_core::{IdempotencyKey, JobId, JobKind};
use volitas_infra::leader::{LeaderLock, RedisLeaderLock};
use volitas_infra::{
    BeatConfig, BeatScheduler, JobExecutor, Settings, WorkerPool, WorkerPoolConfig,
};

use crate::app::{self, build_services, AppServices};
use crate::cli::{Command, DlqCommand};
use crate::handlers;

pub async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    if let Command::Routes = command {
        // No database needed to show configuration.
        println!("{}", serde_json::to_string_pretty(&settings.routing)?);
        return Ok(());
    }

    let services = build_services(&settings)
        .await
        .with_context(|| format!("failed to open store at {}", settings.database_url))?;

    match command {
        Command::Beat => beat(&settings, services).await,
        Command::Worker { queue } => worker(&settings, services, &queue).await,
        Command::Submit { kind, payload, key } => submit(&services, kind, &payload, key).await,
        Command::Status { job_id } => status(&services, &job_id).await,
        Command::Dlq { command } => dlq(&services, command).await,
        Command::Routes => Ok(()),
    }
}

async fn beat(settings: &Settings, services: AppServices) -> anyhow::Result<()> {
    let lock: Arc<dyn LeaderLock> = match &settings.redis_url {
        Some(url) => Arc::new(RedisLeaderLock::new(url, None).context("invalid redis url")?),
        None => {
            info!(database = %settings.database_url, "no redis configured; using the database leader lease");
            services.stores.leader.clone()
        }
    };

    let config = BeatConfig {
        wake_interval: settings.beat_wake_interval,
        catch_up: settings.catch_up,
        lock_ttl: settings.beat_wake_interval * 6,
        ..BeatConfig::default()
    };
    let beat = Arc::new(BeatScheduler::new(
        services.stores.schedule.clone(),
        services.router.clone(),
        lock,
        services.clock.clone(),
        config,
    ));

    for entry in handlers::builtin_entries(settings, services.clock.now())? {
        beat.register(&entry)
            .await
            .with_context(|| format!("failed to register schedule entry {}", entry.name))?;
    }

    let handle = beat.spawn();
    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

async fn worker(settings: &Settings, services: AppServices, queue: &str) -> anyhow::Result<()> {
    let policy = services
        .table
        .queue(queue)
        .ok_or_else(|| anyhow!("queue {queue:?} is not declared in the routing table"))?;

    let registry = handlers::registry(settings, &services).context("failed to build handlers")?;
    let executor = Arc::new(
        JobExecutor::new(registry, services.stores.dedup.clone(), services.clock.clone())
            .with_time_budget(settings.job_time_budget),
    );
    let config = WorkerPoolConfig::for_queue(policy)
        .with_retry_policy(settings.retry.clone())
        .with_stale_claim_after(settings.stale_claim_after);
    let pool = WorkerPool::new(
        config,
        services.stores.queue.clone(),
        executor,
        services.dead_letters.clone(),
        services.clock.clone(),
    );
    let handle = pool.spawn();

    let listener = tokio::net::TcpListener::bind(settings.health_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.health_addr))?;
    info!(addr = %listener.local_addr()?, queue, "serving health endpoints");

    let served = axum::serve(listener, app::build_app(Arc::new(services)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    handle.shutdown().await;
    served.context("http server failed")
}

async fn submit(services: &AppServices, kind: String, payload: &str, key: Option<String>) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let job_id = services
        .jobs
        .submit(JobKind::from(kind), payload, key.map(IdempotencyKey::new))
        .await?;
    println!("{job_id}");
    Ok(())
}

async fn status(services: &AppServices, job_id: &str) -> anyhow::Result<()> {
    let id = job_id.parse::<JobId>().with_context(|| format!("{job_id:?} is not a job id"))?;
    let view = services
        .jobs
        .status(id)
        .await?
        .ok_or_else(|| anyhow!("job {job_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn dlq(services: &AppServices, command: DlqCommand) -> anyhow::Result<()> {
    match command {
        DlqCommand::List => {
            let summaries: Vec<_> = services
                .dead_letters
                .list()
                .await?
                .iter()
                .map(app::dto::DeadLetterSummary::from)
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        DlqCommand::Requeue { job_id } => {
            let id = job_id.parse::<JobId>().with_context(|| format!("{job_id:?} is not a job id"))?;
            let receipt = services.dead_letters.requeue(id).await?;
            println!("{}", receipt.job_id());
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
