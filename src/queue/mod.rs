//! Task queue capability
//!
//! The pipeline never talks to a queue implementation directly: the driver
//! and the scheduler receive an `Arc<dyn TaskQueue>` and only ever call
//! [`TaskQueue::enqueue`] or [`TaskQueue::enqueue_after`]. Delivery is
//! at-least-once.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job_state::JobId;
use crate::providers::Provider;

pub mod db;
pub mod memory;

pub use db::DbTaskQueue;
pub use memory::InMemoryTaskQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("task payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("task {id} has an unreadable payload: {details}")]
    Payload { id: Uuid, details: String },
}

/// Arguments of one scrape step delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub provider: Provider,
    pub connection_id: Uuid,
    pub job_id: JobId,
    /// Not-ready retry counter, carried in the message rather than the store.
    #[serde(default)]
    pub tries: u32,
}

impl ScrapeTask {
    pub fn new(provider: Provider, connection_id: Uuid, job_id: JobId) -> Self {
        Self {
            provider,
            connection_id,
            job_id,
            tries: 0,
        }
    }

    pub fn with_tries(&self, tries: u32) -> Self {
        Self {
            tries,
            ..self.clone()
        }
    }
}

/// Messages this crate produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    Scrape(ScrapeTask),
    SyncTimeline { connection_id: Uuid },
    RegenerateProfile { connection_id: Uuid },
}

impl Task {
    pub const SCRAPE: &'static str = "scrape";
    pub const SYNC_TIMELINE: &'static str = "sync_timeline";
    pub const REGENERATE_PROFILE: &'static str = "regenerate_profile";

    pub fn name(&self) -> &'static str {
        match self {
            Task::Scrape(_) => Self::SCRAPE,
            Task::SyncTimeline { .. } => Self::SYNC_TIMELINE,
            Task::RegenerateProfile { .. } => Self::REGENERATE_PROFILE,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        match self {
            Task::Scrape(task) => task.connection_id,
            Task::SyncTimeline { connection_id } | Task::RegenerateProfile { connection_id } => {
                *connection_id
            }
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    async fn enqueue_after(&self, delay: Duration, task: Task) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_is_tagged_by_name() {
        let connection_id = Uuid::new_v4();
        let task = Task::Scrape(ScrapeTask::new(
            Provider::GitHub,
            connection_id,
            JobId::new("job-1"),
        ));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "scrape");
        assert_eq!(json["provider"], "github");
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["tries"], 0);
        assert_eq!(task.name(), Task::SCRAPE);
        assert_eq!(task.connection_id(), connection_id);
    }

    #[test]
    fn tries_defaults_to_zero_when_absent() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({
            "task": "scrape",
            "provider": "wakatime",
            "connection_id": id,
            "job_id": "j",
        });
        let Task::Scrape(task) = serde_json::from_value(json).unwrap() else {
            panic!("expected scrape task");
        };
        assert_eq!(task.tries, 0);
        assert_eq!(task.with_tries(3).tries, 3);
    }
}
