//! Queued task entity model
//!
//! Backing table of the database task queue. A row is one delivery of one
//! [`crate::queue::Task`]; `run_at` implements delayed delivery.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "queued_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Consumer routing key, see [`crate::queue::Task::name`]
    pub task_name: String,

    /// Connection the task concerns, denormalised for pending checks
    pub connection_id: Option<Uuid>,

    /// Serialized [`crate::queue::Task`]
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// queued | running | succeeded | failed
    pub status: String,

    /// Number of deliveries so far
    pub attempts: i32,

    /// Earliest time the task may be claimed
    pub run_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
