//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! ingestion tables. Every method returns `DbErr`; callers decide how a
//! database failure maps onto their own error type.

pub mod connection;
pub mod historical_score;
pub mod scrape_record;

pub use connection::{ConnectionRepository, NewConnection};
pub use historical_score::HistoricalScoreRepository;
pub use scrape_record::ScrapeRecordRepository;
