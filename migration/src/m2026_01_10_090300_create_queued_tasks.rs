//! Migration to create the queued_tasks table backing the database task queue.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueuedTasks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueuedTasks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueuedTasks::TaskName).text().not_null())
                    .col(ColumnDef::new(QueuedTasks::ConnectionId).uuid().null())
                    .col(ColumnDef::new(QueuedTasks::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(QueuedTasks::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(QueuedTasks::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueuedTasks::RunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueuedTasks::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(QueuedTasks::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(QueuedTasks::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(QueuedTasks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueuedTasks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim path: due tasks of one name in FIFO order
        manager
            .create_index(
                Index::create()
                    .name("idx_queued_tasks_name_status_run_at")
                    .table(QueuedTasks::Table)
                    .col(QueuedTasks::TaskName)
                    .col(QueuedTasks::Status)
                    .col(QueuedTasks::RunAt)
                    .to_owned(),
            )
            .await?;

        // Pending check used by the resync scheduler
        manager
            .create_index(
                Index::create()
                    .name("idx_queued_tasks_connection_status")
                    .table(QueuedTasks::Table)
                    .col(QueuedTasks::ConnectionId)
                    .col(QueuedTasks::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_queued_tasks_name_status_run_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_queued_tasks_connection_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(QueuedTasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueuedTasks {
    Table,
    Id,
    TaskName,
    ConnectionId,
    Payload,
    Status,
    Attempts,
    RunAt,
    StartedAt,
    FinishedAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
