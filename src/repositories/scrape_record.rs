//! Scrape record repository
//!
//! One row per `(provider, connection, scrape type)`. The upsert reports
//! whether the stored data actually changed so the caller can skip
//! downstream work on identical rescrapes.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::connection;
use crate::models::scrape_record::{self, Column, Entity as ScrapeRecord};

#[derive(Debug, Clone)]
pub struct ScrapeRecordRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ScrapeRecordRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert or replace the record and return whether `data` changed.
    ///
    /// With `touch` set, the record's `scraped_at` and the connection's
    /// `last_scraped_at` are stamped in the same transaction.
    pub async fn upsert(
        &self,
        provider: &str,
        connection_id: Uuid,
        scrape_type: &str,
        data: &JsonValue,
        touch: bool,
    ) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let existing = ScrapeRecord::find()
            .filter(Column::Provider.eq(provider))
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::ScrapeType.eq(scrape_type))
            .one(&txn)
            .await?;

        let changed = match existing {
            Some(record) => {
                let changed = &record.data != data;
                let scraped_at = record.scraped_at;
                let mut active: scrape_record::ActiveModel = record.into();
                active.data = Set(data.clone());
                active.scraped_at = Set(if touch { Some(now) } else { scraped_at });
                active.updated_at = Set(now);
                active.update(&txn).await?;
                changed
            }
            None => {
                scrape_record::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    provider: Set(provider.to_string()),
                    connection_id: Set(connection_id),
                    scrape_type: Set(scrape_type.to_string()),
                    data: Set(data.clone()),
                    scraped_at: Set(touch.then_some(now)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
                true
            }
        };

        if touch
            && let Some(conn) = connection::Entity::find_by_id(connection_id).one(&txn).await?
        {
            let mut active: connection::ActiveModel = conn.into();
            active.last_scraped_at = Set(Some(now));
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(changed)
    }

    pub async fn find(
        &self,
        provider: &str,
        connection_id: Uuid,
        scrape_type: &str,
    ) -> Result<Option<scrape_record::Model>, DbErr> {
        ScrapeRecord::find()
            .filter(Column::Provider.eq(provider))
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::ScrapeType.eq(scrape_type))
            .one(self.db.as_ref())
            .await
    }

    pub async fn list_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<scrape_record::Model>, DbErr> {
        ScrapeRecord::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .all(self.db.as_ref())
            .await
    }
}
