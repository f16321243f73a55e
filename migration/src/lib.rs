//! Database migrations for the ingestion pipeline tables.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_090000_create_connections;
mod m2026_01_10_090100_create_scrape_records;
mod m2026_01_10_090200_create_historical_scores;
mod m2026_01_10_090300_create_queued_tasks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_090000_create_connections::Migration),
            Box::new(m2026_01_10_090100_create_scrape_records::Migration),
            Box::new(m2026_01_10_090200_create_historical_scores::Migration),
            Box::new(m2026_01_10_090300_create_queued_tasks::Migration),
        ]
    }
}
