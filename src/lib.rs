//! # Activity Ingest Library
//!
//! Resumable, lock-protected scrape pipeline that pages through third-party
//! provider APIs one bounded step at a time and persists one aggregate record
//! per completed run.

pub mod config;
pub mod db;
pub mod error;
pub mod job_state;
pub mod lock;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod worker;
pub use migration;
