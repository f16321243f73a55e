//! Connection repository for database operations
//!
//! Covers the connection lifecycle the pipeline needs: lookups, the error
//! counter, cached profile data and the staleness scan used by the periodic
//! resync.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::connection::{self, Column, Entity as Connection};
use crate::providers::Provider;

/// Fields supplied when linking a new account.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub provider: Provider,
    pub external_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates a new connection with a zero error count
    pub async fn create(&self, new: NewConnection) -> Result<connection::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let model = connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(new.user_id),
            provider: Set(new.provider.slug().to_string()),
            external_id: Set(new.external_id),
            access_token: Set(new.access_token),
            refresh_token: Set(new.refresh_token),
            last_scraped_at: Set(None),
            last_synced_user_info_at: Set(None),
            error_count: Set(0),
            profile_info: Set(None),
            score: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        model.insert(self.db.as_ref()).await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr> {
        Connection::find_by_id(id).one(self.db.as_ref()).await
    }

    /// Adds one to the error counter in a single statement
    pub async fn increment_error_count(&self, id: Uuid) -> Result<(), DbErr> {
        Connection::update_many()
            .col_expr(Column::ErrorCount, Expr::col(Column::ErrorCount).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Zeroes the error counter; returns whether a row actually changed
    pub async fn reset_error_count(&self, id: Uuid) -> Result<bool, DbErr> {
        let result = Connection::update_many()
            .col_expr(Column::ErrorCount, Expr::value(0))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::ErrorCount.ne(0))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Stores the latest profile and score and stamps the sync time
    pub async fn record_profile(
        &self,
        id: Uuid,
        profile: Option<JsonValue>,
        score: Option<f64>,
    ) -> Result<(), DbErr> {
        let now = Utc::now().fixed_offset();
        let mut update = Connection::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id));
        if let Some(profile) = profile {
            update = update
                .col_expr(Column::ProfileInfo, Expr::value(profile))
                .col_expr(Column::LastSyncedUserInfoAt, Expr::value(now));
        }
        if let Some(score) = score {
            update = update.col_expr(Column::Score, Expr::value(score));
        }
        update.exec(self.db.as_ref()).await?;
        Ok(())
    }

    /// Deletes the connection; its scrape records go with it
    pub async fn delete(&self, id: Uuid) -> Result<bool, DbErr> {
        let result = Connection::delete_by_id(id).exec(self.db.as_ref()).await?;
        Ok(result.rows_affected > 0)
    }

    /// Connections never scraped or last scraped before `cutoff`, excluding
    /// suspended ones, oldest first
    pub async fn list_due_for_resync(
        &self,
        cutoff: DateTimeWithTimeZone,
        suspend_after: i32,
        limit: u64,
    ) -> Result<Vec<connection::Model>, DbErr> {
        Connection::find()
            .filter(
                Condition::any()
                    .add(Column::LastScrapedAt.is_null())
                    .add(Column::LastScrapedAt.lt(cutoff)),
            )
            .filter(Column::ErrorCount.lte(suspend_after))
            .order_by_asc(Column::LastScrapedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await
    }
}
