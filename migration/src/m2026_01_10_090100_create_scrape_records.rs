//! Migration to create the scrape_records table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScrapeRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScrapeRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScrapeRecords::Provider).text().not_null())
                    .col(ColumnDef::new(ScrapeRecords::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(ScrapeRecords::ScrapeType).text().not_null())
                    .col(ColumnDef::new(ScrapeRecords::Data).json_binary().not_null())
                    .col(
                        ColumnDef::new(ScrapeRecords::ScrapedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ScrapeRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ScrapeRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_scrape_records_connection_id")
                            .from(ScrapeRecords::Table, ScrapeRecords::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One record per (provider, connection, type); the pipeline upserts into it
        manager
            .create_index(
                Index::create()
                    .name("idx_scrape_records_provider_connection_type")
                    .table(ScrapeRecords::Table)
                    .col(ScrapeRecords::Provider)
                    .col(ScrapeRecords::ConnectionId)
                    .col(ScrapeRecords::ScrapeType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_scrape_records_provider_connection_type")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ScrapeRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ScrapeRecords {
    Table,
    Id,
    Provider,
    ConnectionId,
    ScrapeType,
    Data,
    ScrapedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
