//! Generic stage pipeline
//!
//! A provider is a [`StageMachine`]: an ordered stage table plus one handler
//! per stage. Each handler call does one bounded unit of work and reports a
//! [`StepOutcome`]; the [`StageDriver`] owns everything around it (locking,
//! the stage pointer, TTL refresh, persistence and re-enqueueing).

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ScrapeError;
use crate::job_state::{JobScope, StoreError, StoreKey};
use crate::models::connection;
use crate::providers::{Provider, ProviderClient};

pub mod backoff;
pub mod driver;
pub mod registry;
pub mod sink;
pub mod trigger;

pub use backoff::{ErrorPolicy, RetryPolicy};
pub use driver::{DriverSettings, StageDriver, StepReport};
pub use registry::PipelineRegistry;
pub use sink::{DbScrapeSink, ScrapeSink};
pub use trigger::{ScrapeTrigger, TriggerOutcome, TriggerReason};

/// A provider's stage enumeration.
///
/// `ORDER` is the whole transition function: the successor of a stage is the
/// next entry, and the last entry is terminal.
pub trait Stage: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const ORDER: &'static [Self];

    fn name(self) -> &'static str;

    fn parse(name: &str) -> Option<Self> {
        Self::ORDER.iter().copied().find(|stage| stage.name() == name)
    }

    fn first() -> Option<Self> {
        Self::ORDER.first().copied()
    }

    /// `None` for the terminal stage.
    fn next(self) -> Option<Self> {
        let index = Self::ORDER.iter().position(|stage| *stage == self)?;
        Self::ORDER.get(index + 1).copied()
    }

    fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

/// Aggregate produced by a terminal stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutput {
    pub scrape_type: &'static str,
    pub data: Value,
    /// Derived score appended to the historical series.
    pub score: Option<f64>,
    /// Provider profile cached on the connection.
    pub profile: Option<Value>,
}

impl ScrapeOutput {
    pub fn new(scrape_type: &'static str, data: Value) -> Self {
        Self {
            scrape_type,
            data,
            score: None,
            profile: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_profile(mut self, profile: Value) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// More work remains in the current stage.
    Continue,
    /// More work remains, but upstream asked for a pause before the next call.
    ContinueAfter(Duration),
    /// The current stage is done; move to its successor.
    Advance,
    /// Upstream accepted the request but the result is not ready yet.
    NotReady,
    /// Terminal stage finished; persist and stop.
    Complete(ScrapeOutput),
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Continue => "continue",
            StepOutcome::ContinueAfter(_) => "continue_after",
            StepOutcome::Advance => "advance",
            StepOutcome::NotReady => "not_ready",
            StepOutcome::Complete(_) => "complete",
        }
    }
}

/// Everything a handler may touch during one step.
pub struct StepContext<'a> {
    pub connection: &'a connection::Model,
    pub job: &'a JobScope<'a>,
    pub http: &'a ProviderClient,
    /// Not-ready retries so far in this run.
    pub tries: u32,
}

impl StepContext<'_> {
    /// Bearer token of the connection, required by every provider.
    pub fn access_token(&self) -> Result<&str, ScrapeError> {
        self.connection
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(ScrapeError::MissingCredentials {
                connection_id: self.connection.id,
            })
    }
}

#[async_trait]
pub trait StageMachine: Send + Sync + 'static {
    type Stage: Stage;

    fn provider(&self) -> Provider;

    async fn handle(
        &self,
        stage: Self::Stage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError>;
}

/// Object-safe view of a [`StageMachine`] working on stage names, which is
/// what the state store holds.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn provider(&self) -> Provider;

    fn stage_names(&self) -> Vec<&'static str>;

    fn first_stage(&self) -> Result<&'static str, ScrapeError>;

    /// `Ok(None)` when `current` is terminal.
    fn next_stage(&self, current: &str) -> Result<Option<&'static str>, ScrapeError>;

    async fn run_stage(
        &self,
        stage: &str,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError>;
}

#[async_trait]
impl<M: StageMachine> Pipeline for M {
    fn provider(&self) -> Provider {
        StageMachine::provider(self)
    }

    fn stage_names(&self) -> Vec<&'static str> {
        M::Stage::ORDER.iter().map(|stage| stage.name()).collect()
    }

    fn first_stage(&self) -> Result<&'static str, ScrapeError> {
        M::Stage::first()
            .map(Stage::name)
            .ok_or_else(|| ScrapeError::UnknownStage {
                provider: StageMachine::provider(self),
                stage: String::new(),
            })
    }

    fn next_stage(&self, current: &str) -> Result<Option<&'static str>, ScrapeError> {
        let stage = parse_stage::<M>(self, current)?;
        Ok(stage.next().map(Stage::name))
    }

    async fn run_stage(
        &self,
        stage: &str,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        let stage = parse_stage::<M>(self, stage)?;
        self.handle(stage, cx).await
    }
}

fn parse_stage<M: StageMachine>(machine: &M, name: &str) -> Result<M::Stage, ScrapeError> {
    M::Stage::parse(name).ok_or_else(|| ScrapeError::UnknownStage {
        provider: StageMachine::provider(machine),
        stage: name.to_string(),
    })
}

/// Keep the first record for each key.
///
/// A replayed page pushes its records again; deduplicating at save time is
/// what makes that replay harmless.
pub fn dedupe_by<T, K, F>(items: Vec<T>, mut key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}

/// Head of a per-stage work list without removing it.
///
/// The item is only popped by [`finish_work_item`] once its results are
/// pushed, so a crash mid-item replays it instead of losing it.
pub async fn peek_work_item(
    job: &JobScope<'_>,
    queue: &StoreKey,
) -> Result<Option<String>, StoreError> {
    Ok(job.lvalues(queue).await?.into_iter().next())
}

/// Drop the head of the work list; returns whether items remain.
pub async fn finish_work_item(job: &JobScope<'_>, queue: &StoreKey) -> Result<bool, StoreError> {
    job.lpop(queue).await?;
    Ok(!job.lvalues(queue).await?.is_empty())
}

/// Replace a work list wholesale so re-running the populating step is idempotent.
pub async fn reset_work_list(
    job: &JobScope<'_>,
    queue: &StoreKey,
    items: &[String],
) -> Result<(), StoreError> {
    job.del(queue).await?;
    job.rpush(queue, items).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Demo {
        Fetch,
        Expand,
        Save,
    }

    impl Stage for Demo {
        const ORDER: &'static [Self] = &[Demo::Fetch, Demo::Expand, Demo::Save];

        fn name(self) -> &'static str {
            match self {
                Demo::Fetch => "fetch",
                Demo::Expand => "expand",
                Demo::Save => "save",
            }
        }
    }

    #[test]
    fn stage_table_drives_transitions() {
        assert_eq!(Demo::first(), Some(Demo::Fetch));
        assert_eq!(Demo::Fetch.next(), Some(Demo::Expand));
        assert_eq!(Demo::Expand.next(), Some(Demo::Save));
        assert_eq!(Demo::Save.next(), None);
        assert!(Demo::Save.is_terminal());
        assert_eq!(Demo::parse("expand"), Some(Demo::Expand));
        assert_eq!(Demo::parse("nope"), None);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let items = vec![(1, "a"), (2, "b"), (1, "c"), (3, "d"), (2, "e")];
        let deduped = dedupe_by(items, |(id, _)| *id);
        assert_eq!(deduped, vec![(1, "a"), (2, "b"), (3, "d")]);
    }

    #[tokio::test]
    async fn work_items_are_popped_only_when_finished() {
        use crate::job_state::{InMemoryJobStore, JobId};

        let store = InMemoryJobStore::new(Duration::from_secs(60));
        let job_id = JobId::new("job");
        let job = JobScope::new(&store, &job_id);
        let queue = StoreKey::sub("contributors", "queue");

        reset_work_list(&job, &queue, &["a/x".into(), "a/y".into()])
            .await
            .unwrap();
        // Populating twice must not double the list
        reset_work_list(&job, &queue, &["a/x".into(), "a/y".into()])
            .await
            .unwrap();

        assert_eq!(peek_work_item(&job, &queue).await.unwrap().as_deref(), Some("a/x"));
        assert_eq!(peek_work_item(&job, &queue).await.unwrap().as_deref(), Some("a/x"));
        assert!(finish_work_item(&job, &queue).await.unwrap());
        assert_eq!(peek_work_item(&job, &queue).await.unwrap().as_deref(), Some("a/y"));
        assert!(!finish_work_item(&job, &queue).await.unwrap());
        assert_eq!(peek_work_item(&job, &queue).await.unwrap(), None);
    }
}
