//! Historical score repository
//!
//! At most one score per `(provider, account, day)`: the first write of the
//! day wins and later ones are ignored.

use chrono::{NaiveDate, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::historical_score::{self, Column, Entity as HistoricalScore};

#[derive(Debug, Clone)]
pub struct HistoricalScoreRepository {
    pub db: Arc<DatabaseConnection>,
}

impl HistoricalScoreRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Returns whether a row was inserted.
    pub async fn insert(
        &self,
        provider: &str,
        account_id: &str,
        date: NaiveDate,
        score: f64,
    ) -> Result<bool, DbErr> {
        let model = historical_score::ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(provider.to_string()),
            account_id: Set(account_id.to_string()),
            date: Set(date),
            score: Set(score),
            created_at: Set(Utc::now().fixed_offset()),
        };
        let inserted = HistoricalScore::insert(model)
            .on_conflict(
                OnConflict::columns([Column::Provider, Column::AccountId, Column::Date])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(inserted > 0)
    }

    pub async fn list_for_account(
        &self,
        provider: &str,
        account_id: &str,
    ) -> Result<Vec<historical_score::Model>, DbErr> {
        HistoricalScore::find()
            .filter(Column::Provider.eq(provider))
            .filter(Column::AccountId.eq(account_id))
            .order_by_asc(Column::Date)
            .all(self.db.as_ref())
            .await
    }
}
