//! # Resync Scheduler
//!
//! Background task that periodically selects connections whose last scrape
//! is older than the resync interval and enqueues a scrape run for each,
//! spread out by a random delay. Suspended connections (error count above
//! the threshold) and connections that already have a pending scrape task
//! are skipped, so ticks from several instances never pile up work.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::SchedulerConfig;
use crate::error::ScrapeError;
use crate::models::connection;
use crate::pipeline::{ErrorPolicy, ScrapeTrigger, TriggerOutcome, TriggerReason};
use crate::queue::{DbTaskQueue, Task};
use crate::repositories::ConnectionRepository;

/// Per-tick counters, logged at debug level and exposed for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub connections_polled: u64,
    pub runs_enqueued: u64,
    pub runs_resumed: u64,
    pub skipped_pending: u64,
    pub skipped_suspended: u64,
    pub connections_with_errors: u64,
}

pub struct ResyncScheduler {
    config: SchedulerConfig,
    connections: ConnectionRepository,
    queue: Arc<DbTaskQueue>,
    trigger: ScrapeTrigger,
    error_policy: ErrorPolicy,
}

impl ResyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        connections: ConnectionRepository,
        queue: Arc<DbTaskQueue>,
        trigger: ScrapeTrigger,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            config,
            connections,
            queue,
            trigger,
            error_policy,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ScrapeError> {
        info!("Starting resync scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Resync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("resync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Resync scheduler stopped");
        Ok(())
    }

    pub async fn tick(&self) -> Result<TickStats, ScrapeError> {
        let cutoff = Utc::now() - Duration::seconds(self.config.resync_interval_seconds as i64);
        let candidates = self
            .connections
            .list_due_for_resync(
                cutoff.fixed_offset(),
                self.error_policy.suspend_after,
                self.config.batch_size,
            )
            .await?;

        let mut stats = TickStats::default();
        for connection in &candidates {
            stats.connections_polled += 1;
            if let Err(err) = self.process_connection(connection, &mut stats).await {
                stats.connections_with_errors += 1;
                error!(
                    error = %err,
                    connection_id = %connection.id,
                    "Failed to schedule resync for connection"
                );
            }
        }

        gauge!("resync_scheduler_due_connections").set(candidates.len() as f64);
        debug!(
            polled = stats.connections_polled,
            enqueued = stats.runs_enqueued,
            resumed = stats.runs_resumed,
            skipped_pending = stats.skipped_pending,
            skipped_suspended = stats.skipped_suspended,
            errors = stats.connections_with_errors,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    async fn process_connection(
        &self,
        connection: &connection::Model,
        stats: &mut TickStats,
    ) -> Result<(), ScrapeError> {
        if self.queue.has_pending(Task::SCRAPE, connection.id).await? {
            stats.skipped_pending += 1;
            debug!(
                connection_id = %connection.id,
                "Skipping resync; scrape task already pending"
            );
            return Ok(());
        }

        let jitter = sample_jitter(self.config.jitter_seconds_max, &mut rand::thread_rng());
        let delay = (!jitter.is_zero()).then_some(jitter);
        match self
            .trigger
            .trigger(connection, TriggerReason::Periodic, delay)
            .await?
        {
            TriggerOutcome::Enqueued { resumed, .. } => {
                stats.runs_enqueued += 1;
                if resumed {
                    stats.runs_resumed += 1;
                }
                counter!(
                    "resync_scheduler_enqueued_total",
                    "provider" => connection.provider.clone()
                )
                .increment(1);
            }
            TriggerOutcome::Suspended { .. } => stats.skipped_suspended += 1,
        }
        Ok(())
    }
}

fn sample_jitter<R: Rng + ?Sized>(max_seconds: u64, rng: &mut R) -> TokioDuration {
    if max_seconds == 0 {
        return TokioDuration::ZERO;
    }
    TokioDuration::from_secs(rng.gen_range(0..=max_seconds))
}
