//! Database-backed task queue
//!
//! Tasks are rows in `queued_tasks`. Delayed delivery is a `run_at` in the
//! future; the worker claims due rows in a transaction and marks them
//! running, so two workers never pick up the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, QueryTrait, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use super::{QueueError, Task, TaskQueue};
use crate::models::queued_task::{
    self, ActiveModel, Column, Entity, STATUS_FAILED, STATUS_QUEUED, STATUS_RUNNING,
    STATUS_SUCCEEDED,
};

/// A claimed row together with its decoded task.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub row: queued_task::Model,
    pub task: Task,
}

#[derive(Clone)]
pub struct DbTaskQueue {
    db: DatabaseConnection,
}

impl DbTaskQueue {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn insert(&self, task: Task, run_at: DateTimeWithTimeZone) -> Result<Uuid, QueueError> {
        let now = Utc::now().fixed_offset();
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            task_name: Set(task.name().to_string()),
            connection_id: Set(Some(task.connection_id())),
            payload: Set(serde_json::to_value(&task)?),
            status: Set(STATUS_QUEUED.to_string()),
            attempts: Set(0),
            run_at: Set(run_at),
            started_at: Set(None),
            finished_at: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = row.insert(&self.db).await?;
        debug!(
            task_id = %inserted.id,
            task_name = %inserted.task_name,
            run_at = %inserted.run_at,
            "Task enqueued"
        );
        Ok(inserted.id)
    }

    /// Claim up to `batch` due tasks with the given name.
    ///
    /// Rows whose connection already has a running task are skipped so one
    /// connection is never worked on twice at the same time by this queue.
    pub async fn claim_due(
        &self,
        task_name: &str,
        batch: u64,
    ) -> Result<Vec<ClaimedTask>, QueueError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let eligible = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::TaskName.eq(task_name))
            .filter(Column::Status.eq(STATUS_QUEUED))
            .filter(Column::RunAt.lte(now))
            .filter(
                Column::ConnectionId.not_in_subquery(
                    Entity::find()
                        .select_only()
                        .column(Column::ConnectionId)
                        .filter(Column::Status.eq(STATUS_RUNNING))
                        .filter(Column::ConnectionId.is_not_null())
                        .into_query(),
                ),
            )
            .order_by_asc(Column::RunAt)
            .limit(Some(batch))
            .into_tuple::<Uuid>()
            .all(&txn)
            .await?;

        if eligible.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let updated = Entity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_RUNNING))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .filter(Column::Id.is_in(eligible.clone()))
            .filter(Column::Status.eq(STATUS_QUEUED))
            .exec(&txn)
            .await?;

        let rows = if updated.rows_affected > 0 {
            Entity::find()
                .filter(Column::Id.is_in(eligible))
                .filter(Column::Status.eq(STATUS_RUNNING))
                .filter(Column::StartedAt.eq(now))
                .order_by_asc(Column::RunAt)
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };
        txn.commit().await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Task>(row.payload.clone()) {
                Ok(task) => claimed.push(ClaimedTask { row, task }),
                Err(err) => {
                    // Poison rows are failed immediately instead of being retried forever
                    self.fail(row.id, serde_json::json!({ "message": err.to_string() }))
                        .await?;
                    return Err(QueueError::Payload {
                        id: row.id,
                        details: err.to_string(),
                    });
                }
            }
        }
        Ok(claimed)
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.finish(id, STATUS_SUCCEEDED, None).await
    }

    pub async fn fail(&self, id: Uuid, error: JsonValue) -> Result<(), QueueError> {
        self.finish(id, STATUS_FAILED, Some(error)).await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: &str,
        error: Option<JsonValue>,
    ) -> Result<(), QueueError> {
        let now = Utc::now().fixed_offset();
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::LastError, Expr::value(error))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Put running rows that were started too long ago back in the queue.
    ///
    /// A worker that dies mid-task leaves its row running; the pipeline is
    /// replay safe, so redelivery is the recovery.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_QUEUED))
            .col_expr(Column::StartedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(Column::Status.eq(STATUS_RUNNING))
            .filter(Column::StartedAt.lt(cutoff.fixed_offset()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Whether a queued or running task of this name exists for the connection.
    pub async fn has_pending(&self, task_name: &str, connection_id: Uuid) -> Result<bool, QueueError> {
        let count = Entity::find()
            .filter(Column::TaskName.eq(task_name))
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.is_in([STATUS_QUEUED, STATUS_RUNNING]))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl TaskQueue for DbTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.insert(task, Utc::now().fixed_offset()).await?;
        Ok(())
    }

    async fn enqueue_after(&self, delay: Duration, task: Task) -> Result<(), QueueError> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.insert(task, (Utc::now() + delay).fixed_offset()).await?;
        Ok(())
    }
}
