//! Connection entity model
//!
//! One user's linkage to one upstream provider account, plus the counters and
//! cached profile data the ingestion pipeline maintains on it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::providers::{Provider, UnknownProvider};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Local user owning the connection
    pub user_id: Uuid,

    /// Provider slug (see [`Provider`])
    pub provider: String,

    /// Account identifier on the provider side
    pub external_id: String,

    pub access_token: Option<String>,

    pub refresh_token: Option<String>,

    /// Set when a run persists its scrape record
    pub last_scraped_at: Option<DateTimeWithTimeZone>,

    /// Set when a run refreshes `profile_info`
    pub last_synced_user_info_at: Option<DateTimeWithTimeZone>,

    /// Consecutive failed runs; reset on success
    pub error_count: i32,

    /// Cached provider profile (opaque JSON)
    #[sea_orm(column_type = "JsonBinary")]
    pub profile_info: Option<JsonValue>,

    /// Most recent derived score
    #[sea_orm(column_type = "Double")]
    pub score: Option<f64>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn provider(&self) -> Result<Provider, UnknownProvider> {
        self.provider.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::scrape_record::Entity")]
    ScrapeRecord,
}

impl Related<super::scrape_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ScrapeRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
