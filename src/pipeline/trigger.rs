//! Entry point of a scrape run
//!
//! Both the periodic scheduler and explicit requests go through
//! [`ScrapeTrigger`], which resumes the connection's in-flight job when one
//! exists so stale progress is picked up rather than abandoned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::backoff::ErrorPolicy;
use crate::error::ScrapeError;
use crate::job_state::{JobId, JobScope, JobStateStore, StoreKey};
use crate::models::connection;
use crate::queue::{ScrapeTask, Task, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Scheduled resync; honours the suspension threshold.
    Periodic,
    /// Operator or user request; always attempted.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued { job_id: JobId, resumed: bool },
    Suspended { error_count: i32 },
}

pub struct ScrapeTrigger {
    store: Arc<dyn JobStateStore>,
    queue: Arc<dyn TaskQueue>,
    error_policy: ErrorPolicy,
}

impl ScrapeTrigger {
    pub fn new(
        store: Arc<dyn JobStateStore>,
        queue: Arc<dyn TaskQueue>,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            error_policy,
        }
    }

    pub async fn trigger(
        &self,
        connection: &connection::Model,
        reason: TriggerReason,
        delay: Option<Duration>,
    ) -> Result<TriggerOutcome, ScrapeError> {
        if reason == TriggerReason::Periodic && self.error_policy.is_suspended(connection.error_count)
        {
            debug!(
                connection_id = %connection.id,
                error_count = connection.error_count,
                "Connection suspended, skipping periodic resync"
            );
            return Ok(TriggerOutcome::Suspended {
                error_count: connection.error_count,
            });
        }

        let provider = connection.provider()?;
        let anchor_id = JobId::connection_anchor(connection.id);
        let anchor = JobScope::new(self.store.as_ref(), &anchor_id);
        let (job_id, resumed) = match anchor.get(&StoreKey::active_job()).await? {
            Some(existing) => (JobId::new(existing), true),
            None => (JobId::generate(), false),
        };

        let task = Task::Scrape(ScrapeTask::new(provider, connection.id, job_id.clone()));
        match delay {
            Some(delay) => self.queue.enqueue_after(delay, task).await?,
            None => self.queue.enqueue(task).await?,
        }

        info!(
            connection_id = %connection.id,
            provider = %provider,
            job_id = %job_id,
            resumed,
            reason = ?reason,
            "Scrape run enqueued"
        );
        Ok(TriggerOutcome::Enqueued { job_id, resumed })
    }
}
