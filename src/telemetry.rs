//! Process-wide telemetry: the tracing subscriber and metric descriptions.
//!
//! Metrics are emitted through the `metrics` facade only; whichever recorder
//! the deployment installs picks up the descriptions registered here.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber once and describe the worker's metrics.
///
/// SeaORM and sqlx still log through `log`; those records are bridged into
/// the same subscriber so database activity lands in the structured stream.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
        && !type_name_of_val(log::logger()).contains("LogTracer")
    {
        eprintln!("Warning: `log` records will bypass tracing: {err}");
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Step spans carry provider/connection/job ids, so JSON output keeps them
    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("Warning: keeping the existing tracing subscriber: {err}");
    }

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "scrape_steps_total",
        "Scrape step deliveries by provider and outcome"
    );
    describe_histogram!(
        "scrape_step_duration_ms",
        Unit::Milliseconds,
        "Wall time of one scrape step including lock handling"
    );
    describe_counter!(
        "scrape_lock_contended_total",
        "Deliveries skipped because another step held the connection lock"
    );
    describe_counter!(
        "scrape_failures_total",
        "Failed scrape steps by provider and disposition"
    );
    describe_counter!(
        "scrape_records_changed_total",
        "Completed runs whose scrape record content changed"
    );
    describe_counter!(
        "worker_tasks_claimed_total",
        "Scrape tasks claimed from the queue"
    );
    describe_histogram!(
        "worker_task_duration_ms",
        Unit::Milliseconds,
        "Wall time of one claimed task"
    );
    describe_counter!(
        "resync_scheduler_enqueued_total",
        "Runs enqueued by the periodic resync, by provider"
    );
    describe_histogram!(
        "resync_scheduler_tick_duration_ms",
        Unit::Milliseconds,
        "Wall time of one scheduler tick"
    );
    describe_gauge!(
        "resync_scheduler_due_connections",
        "Connections found due for resync in the last tick"
    );
}
