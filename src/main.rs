//! # Activity Ingest Entry Point
//!
//! `worker` runs the queue consumer, the resync scheduler and the health
//! server in one process; `migrate` applies pending migrations; `enqueue`
//! starts (or resumes) a scrape run for one connection.

use std::sync::Arc;

use activity_ingest::config::{AppConfig, ConfigLoader};
use activity_ingest::job_state::{InMemoryJobStore, JobStateStore, RedisJobStore};
use activity_ingest::lock::{DistributedLock, InMemoryLock, RedisLock};
use activity_ingest::pipeline::{
    DbScrapeSink, DriverSettings, ErrorPolicy, PipelineRegistry, ScrapeTrigger, StageDriver,
    TriggerReason,
};
use activity_ingest::providers::ProviderClient;
use activity_ingest::queue::{DbTaskQueue, TaskQueue};
use activity_ingest::repositories::ConnectionRepository;
use activity_ingest::scheduler::ResyncScheduler;
use activity_ingest::server::run_server;
use activity_ingest::worker::ScrapeWorker;
use activity_ingest::{db, telemetry};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "activity-ingest", version, about = "Resumable multi-provider activity scraper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scrape worker, resync scheduler and health server
    Worker,
    /// Apply pending database migrations and exit
    Migrate,
    /// Enqueue a scrape run for one connection, bypassing suspension
    Enqueue {
        #[arg(long)]
        connection_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initialising telemetry")?;
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command {
        Command::Migrate => {
            Migrator::up(&db, None).await.context("applying migrations")?;
            info!("Migrations applied");
            Ok(())
        }
        Command::Enqueue { connection_id } => enqueue(&config, db, connection_id).await,
        Command::Worker => worker(config, db).await,
    }
}

/// State store and lock backends: Redis when configured, in-process otherwise.
async fn coordination(
    config: &AppConfig,
) -> Result<(Arc<dyn JobStateStore>, Arc<dyn DistributedLock>)> {
    let ttl = config.pipeline.job_state_ttl();
    match &config.redis_url {
        Some(url) => {
            let con = db::init_redis(url).await?;
            Ok((
                Arc::new(RedisJobStore::new(con.clone(), ttl)),
                Arc::new(RedisLock::new(con)),
            ))
        }
        None => {
            warn!("No Redis URL configured, using in-process job state and lock");
            Ok((
                Arc::new(InMemoryJobStore::new(ttl)),
                Arc::new(InMemoryLock::new()),
            ))
        }
    }
}

async fn enqueue(config: &AppConfig, db: DatabaseConnection, connection_id: Uuid) -> Result<()> {
    let (store, _) = coordination(config).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(DbTaskQueue::new(db.clone()));
    let connections = ConnectionRepository::new(Arc::new(db));

    let connection = connections
        .get_by_id(connection_id)
        .await?
        .ok_or_else(|| anyhow!("connection {connection_id} not found"))?;
    let trigger = ScrapeTrigger::new(
        store,
        queue,
        ErrorPolicy::from_config(&config.pipeline),
    );
    let outcome = trigger
        .trigger(&connection, TriggerReason::Explicit, None)
        .await
        .context("enqueueing scrape run")?;
    info!(%connection_id, ?outcome, "Scrape run requested");
    Ok(())
}

async fn worker(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    let (store, lock) = coordination(&config).await?;
    let db_arc = Arc::new(db.clone());
    let queue = Arc::new(DbTaskQueue::new(db.clone()));
    let http = ProviderClient::from_config(&config.providers).context("building HTTP client")?;
    let registry = Arc::new(PipelineRegistry::from_config(&config.providers));
    let error_policy = ErrorPolicy::from_config(&config.pipeline);

    let driver = Arc::new(StageDriver::new(
        registry,
        store.clone(),
        lock,
        queue.clone(),
        Arc::new(DbScrapeSink::new(db_arc.clone())),
        http,
        DriverSettings::from_config(&config.pipeline),
    ));
    let worker = ScrapeWorker::new(queue.clone(), driver, config.worker.clone());
    let scheduler = ResyncScheduler::new(
        config.scheduler.clone(),
        ConnectionRepository::new(db_arc),
        queue.clone(),
        ScrapeTrigger::new(store, queue, error_policy),
        error_policy,
    );

    let addr = config.bind_addr().context("parsing health bind address")?;
    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));
    let server_handle = tokio::spawn(run_server(addr, db, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(err) = worker_handle.await? {
        warn!(error = %err, "Worker exited with error");
    }
    if let Err(err) = scheduler_handle.await? {
        warn!(error = %err, "Scheduler exited with error");
    }
    server_handle.await??;
    Ok(())
}
