//! Migration to create the historical_scores table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(HistoricalScores::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HistoricalScores::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(HistoricalScores::Provider).text().not_null())
                    .col(ColumnDef::new(HistoricalScores::AccountId).text().not_null())
                    .col(ColumnDef::new(HistoricalScores::Date).date().not_null())
                    .col(ColumnDef::new(HistoricalScores::Score).double().not_null())
                    .col(
                        ColumnDef::new(HistoricalScores::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Conflict target for the insert-or-ignore in the score repository
        manager
            .create_index(
                Index::create()
                    .name("idx_historical_scores_provider_account_date")
                    .table(HistoricalScores::Table)
                    .col(HistoricalScores::Provider)
                    .col(HistoricalScores::AccountId)
                    .col(HistoricalScores::Date)
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
                    .name("idx_historical_scores_provider_account_date")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(HistoricalScores::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum HistoricalScores {
    Table,
    Id,
    Provider,
    AccountId,
    Date,
    Score,
    CreatedAt,
}
