//! # Data Models
//!
//! SeaORM entities for the tables the ingestion pipeline reads and writes.

pub mod connection;
pub mod historical_score;
pub mod queued_task;
pub mod scrape_record;

pub use connection::Entity as Connection;
pub use historical_score::Entity as HistoricalScore;
pub use queued_task::Entity as QueuedTask;
pub use scrape_record::Entity as ScrapeRecord;
