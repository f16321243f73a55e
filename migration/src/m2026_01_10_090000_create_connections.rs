//! Migration to create the connections table.
//!
//! One row per linked provider account, with the error counter, cached
//! profile and score maintained by the ingestion pipeline.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::UserId).uuid().not_null())
                    .col(ColumnDef::new(Connections::Provider).text().not_null())
                    .col(ColumnDef::new(Connections::ExternalId).text().not_null())
                    .col(ColumnDef::new(Connections::AccessToken).text().null())
                    .col(ColumnDef::new(Connections::RefreshToken).text().null())
                    .col(
                        ColumnDef::new(Connections::LastScrapedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::LastSyncedUserInfoAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ErrorCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Connections::ProfileInfo).json_binary().null())
                    .col(ColumnDef::new(Connections::Score).double().null())
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_user_provider_external")
                    .table(Connections::Table)
                    .col(Connections::UserId)
                    .col(Connections::Provider)
                    .col(Connections::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Periodic resync scans by staleness
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_last_scraped_at")
                    .table(Connections::Table)
                    .col(Connections::LastScrapedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_user_provider_external")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_last_scraped_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    UserId,
    Provider,
    ExternalId,
    AccessToken,
    RefreshToken,
    LastScrapedAt,
    LastSyncedUserInfoAt,
    ErrorCount,
    ProfileInfo,
    Score,
    CreatedAt,
    UpdatedAt,
}
