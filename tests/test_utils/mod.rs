//! Test utilities for pipeline integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, connection
//! fixtures, and a driver harness wired to in-memory state store, lock and
//! recording queue so a whole run can be drained synchronously.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use activity_ingest::error::ScrapeError;
use activity_ingest::job_state::InMemoryJobStore;
use activity_ingest::lock::InMemoryLock;
use activity_ingest::models::connection;
use activity_ingest::pipeline::{
    DbScrapeSink, DriverSettings, ErrorPolicy, PipelineRegistry, ScrapeSink, ScrapeTrigger,
    StageDriver, StepReport, TriggerOutcome, TriggerReason,
};
use activity_ingest::providers::{Provider, ProviderClient};
use activity_ingest::queue::{InMemoryTaskQueue, Task};
use activity_ingest::repositories::{ConnectionRepository, NewConnection};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection, DbErr};
use serde_json::Value;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Inserts a connection with a usable access token.
pub async fn insert_connection(
    db: &Arc<DatabaseConnection>,
    provider: Provider,
    external_id: &str,
) -> Result<connection::Model> {
    let repo = ConnectionRepository::new(db.clone());
    Ok(repo
        .create(NewConnection {
            user_id: Uuid::new_v4(),
            provider,
            external_id: external_id.to_string(),
            access_token: Some("test-token".to_string()),
            refresh_token: None,
        })
        .await?)
}

pub fn http_client() -> ProviderClient {
    ProviderClient::new("activity-ingest-tests", Duration::from_secs(5))
        .expect("test HTTP client builds")
}

/// [`DbScrapeSink`] that also counts scrape record upserts.
pub struct CountingSink {
    inner: DbScrapeSink,
    upserts: AtomicUsize,
}

impl CountingSink {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            inner: DbScrapeSink::new(db),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrapeSink for CountingSink {
    async fn load_connection(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr> {
        self.inner.load_connection(id).await
    }

    async fn upsert_scrape_record(
        &self,
        provider: &str,
        connection_id: Uuid,
        scrape_type: &str,
        data: &Value,
        touch_scraped_at: bool,
    ) -> Result<bool, DbErr> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner
            .upsert_scrape_record(provider, connection_id, scrape_type, data, touch_scraped_at)
            .await
    }

    async fn increment_error_count(&self, connection_id: Uuid) -> Result<(), DbErr> {
        self.inner.increment_error_count(connection_id).await
    }

    async fn reset_error_count(&self, connection_id: Uuid) -> Result<bool, DbErr> {
        self.inner.reset_error_count(connection_id).await
    }

    async fn insert_historical_score(
        &self,
        provider: &str,
        account_id: &str,
        date: NaiveDate,
        score: f64,
    ) -> Result<bool, DbErr> {
        self.inner
            .insert_historical_score(provider, account_id, date, score)
            .await
    }

    async fn record_profile(
        &self,
        connection_id: Uuid,
        profile: Option<Value>,
        score: Option<f64>,
    ) -> Result<(), DbErr> {
        self.inner.record_profile(connection_id, profile, score).await
    }

    async fn delete_connection(&self, connection_id: Uuid) -> Result<bool, DbErr> {
        self.inner.delete_connection(connection_id).await
    }
}

/// What draining the recording queue produced.
#[derive(Debug, Default)]
pub struct Drained {
    pub reports: Vec<StepReport>,
    /// Delay attached to each scrape delivery that was run, in order.
    pub delays: Vec<Option<Duration>>,
    /// Non-scrape tasks, left for consumers outside the pipeline.
    pub downstream: Vec<Task>,
    /// First failing step, after which draining stopped.
    pub error: Option<ScrapeError>,
}

impl Drained {
    pub fn count(&self, label: &str) -> usize {
        self.reports.iter().filter(|r| r.label() == label).count()
    }
}

/// A stage driver over in-memory coordination and a real SQLite sink.
pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub store: Arc<InMemoryJobStore>,
    pub lock: Arc<InMemoryLock>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub sink: Arc<CountingSink>,
    pub driver: StageDriver,
}

impl Harness {
    pub async fn new(registry: PipelineRegistry) -> Result<Self> {
        Self::with_settings(registry, DriverSettings::default()).await
    }

    pub async fn with_settings(registry: PipelineRegistry, settings: DriverSettings) -> Result<Self> {
        let db = setup_test_db().await?;
        let store = Arc::new(InMemoryJobStore::new(Duration::from_secs(86_400)));
        let lock = Arc::new(InMemoryLock::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let sink = Arc::new(CountingSink::new(db.clone()));
        let driver = StageDriver::new(
            Arc::new(registry),
            store.clone(),
            lock.clone(),
            queue.clone(),
            sink.clone(),
            http_client(),
            settings,
        );
        Ok(Self {
            db,
            store,
            lock,
            queue,
            sink,
            driver,
        })
    }

    pub fn connections(&self) -> ConnectionRepository {
        ConnectionRepository::new(self.db.clone())
    }

    pub fn trigger(&self) -> ScrapeTrigger {
        ScrapeTrigger::new(self.store.clone(), self.queue.clone(), ErrorPolicy::default())
    }

    /// Enqueue a run for the connection and return its trigger outcome.
    pub async fn start(&self, connection: &connection::Model) -> Result<TriggerOutcome> {
        Ok(self
            .trigger()
            .trigger(connection, TriggerReason::Explicit, None)
            .await?)
    }

    /// Run queued scrape deliveries until the queue is empty, a step fails,
    /// or `max_steps` deliveries have run.
    pub async fn drain(&self, max_steps: usize) -> Drained {
        let mut drained = Drained::default();
        while drained.reports.len() < max_steps {
            let Some(entry) = self.queue.pop().await else {
                break;
            };
            let Task::Scrape(task) = entry.task else {
                drained.downstream.push(entry.task);
                continue;
            };
            drained.delays.push(entry.delay);
            match self.driver.run(&task).await {
                Ok(report) => drained.reports.push(report),
                Err(err) => {
                    drained.error = Some(err);
                    break;
                }
            }
        }
        drained
    }

    pub async fn reload(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(self.connections().get_by_id(id).await?)
    }
}
