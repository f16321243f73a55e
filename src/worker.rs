//! Scrape worker
//!
//! Background loop that claims due `scrape` tasks from the database queue
//! and runs exactly one driver step per task. Tasks are never retried here:
//! a failed step is recorded on its row and the run is resumed later by the
//! resync scheduler from its last bumped checkpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::pipeline::StageDriver;
use crate::queue::db::ClaimedTask;
use crate::queue::{DbTaskQueue, QueueError, Task};

/// Outcome counts of one worker tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub requeued_stale: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct ScrapeWorker {
    queue: Arc<DbTaskQueue>,
    driver: Arc<StageDriver>,
    config: WorkerConfig,
}

impl ScrapeWorker {
    pub fn new(queue: Arc<DbTaskQueue>, driver: Arc<StageDriver>, config: WorkerConfig) -> Self {
        Self {
            queue,
            driver,
            config,
        }
    }

    /// Run until the shutdown token fires. In-flight steps of the current
    /// tick are allowed to finish.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), QueueError> {
        info!(config = ?self.config, "Starting scrape worker");
        let tick = Duration::from_millis(self.config.tick_ms);

        loop {
            let started = Instant::now();
            match self.tick().await {
                Ok(summary) if summary.claimed > 0 => {
                    debug!(?summary, "Worker tick completed");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "Worker tick failed"),
            }

            let remaining = tick.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scrape worker shutdown requested");
                    break;
                }
                _ = sleep(remaining) => {}
            }
        }

        info!("Scrape worker stopped");
        Ok(())
    }

    /// Requeue abandoned rows, then claim and execute one batch.
    pub async fn tick(&self) -> Result<TickSummary, QueueError> {
        let mut summary = TickSummary {
            requeued_stale: self
                .queue
                .requeue_stale(Duration::from_secs(self.config.stale_after_seconds))
                .await?,
            ..TickSummary::default()
        };
        if summary.requeued_stale > 0 {
            warn!(
                count = summary.requeued_stale,
                "Requeued scrape tasks abandoned by a crashed worker"
            );
        }

        let claimed = self
            .queue
            .claim_due(Task::SCRAPE, self.config.claim_batch)
            .await?;
        summary.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(summary);
        }
        counter!("worker_tasks_claimed_total").increment(claimed.len() as u64);

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::with_capacity(claimed.len());
        for claimed_task in claimed {
            // The semaphore is never closed, so acquisition cannot fail
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let queue = self.queue.clone();
            let driver = self.driver.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                execute(&queue, &driver, claimed_task).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(join_err) => {
                    summary.failed += 1;
                    error!(error = %join_err, "Scrape task panicked");
                }
            }
        }
        Ok(summary)
    }
}

/// Run one claimed task and record its outcome on the row; returns whether
/// the step succeeded.
async fn execute(queue: &DbTaskQueue, driver: &StageDriver, claimed: ClaimedTask) -> bool {
    let ClaimedTask { row, task } = claimed;
    let started = Instant::now();

    let outcome = match &task {
        Task::Scrape(scrape) => driver.run(scrape).await.map_err(|err| {
            json!({
                "message": err.to_string(),
                "disposition": err.disposition().as_str(),
            })
        }),
        other => Err(json!({
            "message": format!("worker cannot run '{}' tasks", other.name()),
        })),
    };

    histogram!("worker_task_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);

    let (succeeded, recorded) = match outcome {
        Ok(report) => {
            debug!(task_id = %row.id, outcome = report.label(), "Scrape task finished");
            (true, queue.complete(row.id).await)
        }
        Err(details) => (false, queue.fail(row.id, details).await),
    };
    if let Err(err) = recorded {
        error!(task_id = %row.id, error = %err, "Failed to record scrape task outcome");
    }
    succeeded
}
