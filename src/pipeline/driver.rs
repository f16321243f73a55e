//! Stage driver
//!
//! Runs exactly one stage step per delivered [`ScrapeTask`]:
//! lock → handler → lock release → continuation enqueue. Handlers never
//! enqueue anything themselves; the driver turns their [`StepOutcome`] into
//! the next task (or none), so a run is a chain of short, independent
//! deliveries that any worker can pick up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::RetryPolicy;
use super::registry::PipelineRegistry;
use super::sink::ScrapeSink;
use super::{ScrapeOutput, StepContext, StepOutcome};
use crate::config::PipelineConfig;
use crate::error::{Disposition, ScrapeError};
use crate::job_state::{JobId, JobScope, JobStateStore, StoreKey};
use crate::lock::{DistributedLock, connection_lock_name};
use crate::models::connection;
use crate::providers::{Provider, ProviderClient};
use crate::queue::{ScrapeTask, Task, TaskQueue};

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub lock_ttl: Duration,
    pub retry: RetryPolicy,
}

impl DriverSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            retry: RetryPolicy::from_config(config),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// What one delivery did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    /// Another step holds the connection lock; nothing was done.
    Contended,
    /// The connection was deleted since the task was enqueued.
    ConnectionMissing,
    /// The job already ran to completion or gave up; a redelivered task.
    AlreadyFinished,
    Continued { stage: String },
    Advanced { from: String, to: &'static str },
    RetryScheduled { tries: u32, delay: Duration },
    GaveUp { tries: u32 },
    Completed { changed: bool },
}

impl StepReport {
    pub fn label(&self) -> &'static str {
        match self {
            StepReport::Contended => "contended",
            StepReport::ConnectionMissing => "connection_missing",
            StepReport::AlreadyFinished => "already_finished",
            StepReport::Continued { .. } => "continued",
            StepReport::Advanced { .. } => "advanced",
            StepReport::RetryScheduled { .. } => "retry_scheduled",
            StepReport::GaveUp { .. } => "gave_up",
            StepReport::Completed { .. } => "completed",
        }
    }
}

/// A task to enqueue once the lock is released.
#[derive(Debug)]
struct Continuation {
    delay: Option<Duration>,
    task: Task,
}

impl Continuation {
    fn now(task: Task) -> Self {
        Self { delay: None, task }
    }

    fn after(delay: Duration, task: Task) -> Self {
        Self {
            delay: Some(delay),
            task,
        }
    }
}

pub struct StageDriver {
    registry: Arc<PipelineRegistry>,
    store: Arc<dyn JobStateStore>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn TaskQueue>,
    sink: Arc<dyn ScrapeSink>,
    http: ProviderClient,
    settings: DriverSettings,
}

impl StageDriver {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        store: Arc<dyn JobStateStore>,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<dyn TaskQueue>,
        sink: Arc<dyn ScrapeSink>,
        http: ProviderClient,
        settings: DriverSettings,
    ) -> Self {
        Self {
            registry,
            store,
            lock,
            queue,
            sink,
            http,
            settings,
        }
    }

    /// Execute one step of the run identified by `task`.
    ///
    /// Errors are logged, applied to the connection according to their
    /// [`Disposition`] and returned; a failed step never re-enqueues.
    #[instrument(
        skip(self, task),
        fields(
            provider = %task.provider,
            connection_id = %task.connection_id,
            job_id = %task.job_id,
            tries = task.tries
        )
    )]
    pub async fn run(&self, task: &ScrapeTask) -> Result<StepReport, ScrapeError> {
        let started = Instant::now();
        let provider = task.provider.slug();
        let lock_name = connection_lock_name(task.connection_id);

        let Some(token) = self
            .lock
            .acquire(&lock_name, self.settings.lock_ttl)
            .await?
        else {
            debug!("Connection lock is held by another step, skipping");
            counter!("scrape_lock_contended_total", "provider" => provider).increment(1);
            return Ok(StepReport::Contended);
        };

        let stepped = match self.step_locked(task).await {
            Ok(stepped) => Ok(stepped),
            Err(err) => {
                self.apply_failure(task, &err).await;
                Err(err)
            }
        };

        match self.lock.release(&lock_name, &token).await {
            Ok(true) => {}
            Ok(false) => warn!("Connection lock expired before release"),
            Err(err) => warn!(error = %err, "Failed to release connection lock, leaving it to expire"),
        }

        let result = match stepped {
            Ok((report, continuations)) => self.dispatch(continuations).await.map(|()| report),
            Err(err) => Err(err),
        };

        histogram!("scrape_step_duration_ms", "provider" => provider)
            .record(started.elapsed().as_secs_f64() * 1000.0);
        let outcome = match &result {
            Ok(report) => report.label(),
            Err(_) => "error",
        };
        counter!("scrape_steps_total", "provider" => provider, "outcome" => outcome).increment(1);

        result
    }

    async fn step_locked(
        &self,
        task: &ScrapeTask,
    ) -> Result<(StepReport, Vec<Continuation>), ScrapeError> {
        let Some(connection) = self.sink.load_connection(task.connection_id).await? else {
            info!("Connection no longer exists, dropping task");
            return Ok((StepReport::ConnectionMissing, Vec::new()));
        };

        let pipeline = self.registry.get(task.provider)?;
        let job = JobScope::new(self.store.as_ref(), &task.job_id);
        let anchor_id = JobId::connection_anchor(connection.id);
        let anchor = JobScope::new(self.store.as_ref(), &anchor_id);

        if let Some(outcome) = job.finished().await? {
            info!(outcome = %outcome, "Job already finished, dropping redelivered task");
            return Ok((StepReport::AlreadyFinished, Vec::new()));
        }

        let stage = match job.get(&StoreKey::stage_pointer()).await? {
            Some(stage) => stage,
            None => {
                let first = pipeline.first_stage()?;
                job.set(&StoreKey::stage_pointer(), first).await?;
                first.to_string()
            }
        };
        anchor
            .set(&StoreKey::active_job(), task.job_id.as_str())
            .await?;

        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &self.http,
            tries: task.tries,
        };
        let outcome = pipeline.run_stage(&stage, &cx).await?;
        debug!(stage = %stage, outcome = outcome.label(), "Stage handler finished");

        if connection.error_count != 0 {
            self.sink.reset_error_count(connection.id).await?;
        }

        let continuation = task.with_tries(0);
        match outcome {
            StepOutcome::Continue => {
                job.bump_all().await?;
                anchor.bump_all().await?;
                Ok((
                    StepReport::Continued { stage },
                    vec![Continuation::now(Task::Scrape(continuation))],
                ))
            }
            StepOutcome::ContinueAfter(delay) => {
                job.bump_all().await?;
                anchor.bump_all().await?;
                debug!(
                    stage = %stage,
                    delay_secs = delay.as_secs(),
                    "Upstream asked for a pause before the next page"
                );
                Ok((
                    StepReport::Continued { stage },
                    vec![Continuation::after(delay, Task::Scrape(continuation))],
                ))
            }
            StepOutcome::Advance => {
                let next = pipeline.next_stage(&stage)?.ok_or_else(|| {
                    ScrapeError::AdvancePastTerminal {
                        provider: task.provider,
                        stage: stage.clone(),
                    }
                })?;
                job.set(&StoreKey::stage_pointer(), next).await?;
                job.bump_all().await?;
                anchor.bump_all().await?;
                info!(from = %stage, to = next, "Advanced to next stage");
                Ok((
                    StepReport::Advanced {
                        from: stage,
                        to: next,
                    },
                    vec![Continuation::now(Task::Scrape(continuation))],
                ))
            }
            StepOutcome::NotReady => match self.settings.retry.delay_for(task.tries) {
                Some(delay) => {
                    job.bump_all().await?;
                    anchor.bump_all().await?;
                    let tries = task.tries + 1;
                    info!(
                        stage = %stage,
                        tries,
                        delay_secs = delay.as_secs(),
                        "Upstream result not ready, retrying later"
                    );
                    Ok((
                        StepReport::RetryScheduled { tries, delay },
                        vec![Continuation::after(
                            delay,
                            Task::Scrape(task.with_tries(tries)),
                        )],
                    ))
                }
                None => {
                    warn!(
                        stage = %stage,
                        tries = task.tries,
                        "Upstream result still not ready, giving up on this run"
                    );
                    job.finish("gave_up").await?;
                    release_anchor(&anchor, &task.job_id).await?;
                    Ok((StepReport::GaveUp { tries: task.tries }, Vec::new()))
                }
            },
            StepOutcome::Complete(output) => {
                let changed = self.persist(&connection, task.provider, output).await?;
                job.finish("completed").await?;
                release_anchor(&anchor, &task.job_id).await?;

                let mut continuations = Vec::new();
                if changed {
                    counter!("scrape_records_changed_total", "provider" => task.provider.slug())
                        .increment(1);
                    continuations.push(Continuation::now(Task::SyncTimeline {
                        connection_id: connection.id,
                    }));
                    continuations.push(Continuation::now(Task::RegenerateProfile {
                        connection_id: connection.id,
                    }));
                }
                info!(changed, "Scrape run completed");
                Ok((StepReport::Completed { changed }, continuations))
            }
        }
    }

    /// The single durable write of a run.
    async fn persist(
        &self,
        connection: &connection::Model,
        provider: Provider,
        output: ScrapeOutput,
    ) -> Result<bool, ScrapeError> {
        let changed = self
            .sink
            .upsert_scrape_record(
                provider.slug(),
                connection.id,
                output.scrape_type,
                &output.data,
                true,
            )
            .await?;

        if let Some(score) = output.score {
            let inserted = self
                .sink
                .insert_historical_score(
                    provider.slug(),
                    &connection.external_id,
                    Utc::now().date_naive(),
                    score,
                )
                .await?;
            debug!(score, inserted, "Historical score recorded");
        }

        if output.profile.is_some() || output.score.is_some() {
            self.sink
                .record_profile(connection.id, output.profile, output.score)
                .await?;
        }

        Ok(changed)
    }

    async fn apply_failure(&self, task: &ScrapeTask, err: &ScrapeError) {
        let disposition = err.disposition();
        counter!(
            "scrape_failures_total",
            "provider" => task.provider.slug(),
            "disposition" => disposition.as_str()
        )
        .increment(1);

        match disposition {
            Disposition::CountAgainstConnection => {
                warn!(error = %err, disposition = disposition.as_str(), "Scrape step failed");
                if let Err(db_err) = self.sink.increment_error_count(task.connection_id).await {
                    error!(error = %db_err, "Failed to increment connection error count");
                }
            }
            Disposition::DeleteConnection => {
                warn!(error = %err, "Upstream account is gone, deleting connection");
                if let Err(db_err) = self.sink.delete_connection(task.connection_id).await {
                    error!(error = %db_err, "Failed to delete connection");
                }
                let job = JobScope::new(self.store.as_ref(), &task.job_id);
                let anchor_id = JobId::connection_anchor(task.connection_id);
                let anchor = JobScope::new(self.store.as_ref(), &anchor_id);
                if let Err(store_err) = job.clear().await {
                    warn!(error = %store_err, "Failed to clear job state of deleted connection");
                }
                if let Err(store_err) = anchor.clear().await {
                    warn!(error = %store_err, "Failed to clear connection anchor");
                }
            }
            Disposition::Abort => {
                error!(error = %err, disposition = disposition.as_str(), "Scrape step aborted");
            }
        }
    }

    async fn dispatch(&self, continuations: Vec<Continuation>) -> Result<(), ScrapeError> {
        for Continuation { delay, task } in continuations {
            match delay {
                Some(delay) => self.queue.enqueue_after(delay, task).await?,
                None => self.queue.enqueue(task).await?,
            }
        }
        Ok(())
    }
}

/// Clear the connection's active-job pointer if it still names this job.
async fn release_anchor(anchor: &JobScope<'_>, job_id: &JobId) -> Result<(), ScrapeError> {
    if anchor.get(&StoreKey::active_job()).await?.as_deref() == Some(job_id.as_str()) {
        anchor.clear().await?;
    }
    Ok(())
}
