//! Durable side of the pipeline
//!
//! The driver only sees [`ScrapeSink`]; [`DbScrapeSink`] maps it onto the
//! repositories.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::Value;
use uuid::Uuid;

use crate::models::connection;
use crate::repositories::{
    ConnectionRepository, HistoricalScoreRepository, ScrapeRecordRepository,
};

#[async_trait]
pub trait ScrapeSink: Send + Sync {
    async fn load_connection(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr>;

    /// Returns whether persisted content changed.
    async fn upsert_scrape_record(
        &self,
        provider: &str,
        connection_id: Uuid,
        scrape_type: &str,
        data: &Value,
        touch_scraped_at: bool,
    ) -> Result<bool, DbErr>;

    async fn increment_error_count(&self, connection_id: Uuid) -> Result<(), DbErr>;

    async fn reset_error_count(&self, connection_id: Uuid) -> Result<bool, DbErr>;

    /// No-op when a score already exists for that day.
    async fn insert_historical_score(
        &self,
        provider: &str,
        account_id: &str,
        date: NaiveDate,
        score: f64,
    ) -> Result<bool, DbErr>;

    async fn record_profile(
        &self,
        connection_id: Uuid,
        profile: Option<Value>,
        score: Option<f64>,
    ) -> Result<(), DbErr>;

    async fn delete_connection(&self, connection_id: Uuid) -> Result<bool, DbErr>;
}

#[derive(Debug, Clone)]
pub struct DbScrapeSink {
    connections: ConnectionRepository,
    records: ScrapeRecordRepository,
    scores: HistoricalScoreRepository,
}

impl DbScrapeSink {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            connections: ConnectionRepository::new(db.clone()),
            records: ScrapeRecordRepository::new(db.clone()),
            scores: HistoricalScoreRepository::new(db),
        }
    }
}

#[async_trait]
impl ScrapeSink for DbScrapeSink {
    async fn load_connection(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr> {
        self.connections.get_by_id(id).await
    }

    async fn upsert_scrape_record(
        &self,
        provider: &str,
        connection_id: Uuid,
        scrape_type: &str,
        data: &Value,
        touch_scraped_at: bool,
    ) -> Result<bool, DbErr> {
        self.records
            .upsert(provider, connection_id, scrape_type, data, touch_scraped_at)
            .await
    }

    async fn increment_error_count(&self, connection_id: Uuid) -> Result<(), DbErr> {
        self.connections.increment_error_count(connection_id).await
    }

    async fn reset_error_count(&self, connection_id: Uuid) -> Result<bool, DbErr> {
        self.connections.reset_error_count(connection_id).await
    }

    async fn insert_historical_score(
        &self,
        provider: &str,
        account_id: &str,
        date: NaiveDate,
        score: f64,
    ) -> Result<bool, DbErr> {
        self.scores.insert(provider, account_id, date, score).await
    }

    async fn record_profile(
        &self,
        connection_id: Uuid,
        profile: Option<Value>,
        score: Option<f64>,
    ) -> Result<(), DbErr> {
        self.connections
            .record_profile(connection_id, profile, score)
            .await
    }

    async fn delete_connection(&self, connection_id: Uuid) -> Result<bool, DbErr> {
        self.connections.delete(connection_id).await
    }
}
