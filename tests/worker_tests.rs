//! Worker ticks against the SQLite-backed task queue.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use activity_ingest::config::WorkerConfig;
use activity_ingest::job_state::{InMemoryJobStore, JobId};
use activity_ingest::lock::InMemoryLock;
use activity_ingest::models::QueuedTask;
use activity_ingest::models::queued_task::{self, STATUS_FAILED, STATUS_QUEUED, STATUS_SUCCEEDED};
use activity_ingest::pipeline::{DbScrapeSink, DriverSettings, PipelineRegistry, StageDriver};
use activity_ingest::providers::{Provider, WakaTimePipeline};
use activity_ingest::queue::{DbTaskQueue, ScrapeTask, Task, TaskQueue};
use activity_ingest::repositories::ConnectionRepository;
use activity_ingest::worker::{ScrapeWorker, TickSummary};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::json;
use test_utils::{http_client, insert_connection, setup_test_db};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STATS_PATH: &str = "/api/v1/users/current/stats/last_7_days";

struct Rig {
    db: Arc<DatabaseConnection>,
    queue: Arc<DbTaskQueue>,
    worker: ScrapeWorker,
}

async fn rig(server: &MockServer) -> Rig {
    let db = setup_test_db().await.unwrap();
    let queue = Arc::new(DbTaskQueue::new(db.as_ref().clone()));
    let mut registry = PipelineRegistry::new();
    registry.register(Arc::new(WakaTimePipeline::new(&server.uri())));
    let driver = StageDriver::new(
        Arc::new(registry),
        Arc::new(InMemoryJobStore::new(Duration::from_secs(86_400))),
        Arc::new(InMemoryLock::new()),
        queue.clone(),
        Arc::new(DbScrapeSink::new(db.clone())),
        http_client(),
        DriverSettings::default(),
    );
    let worker = ScrapeWorker::new(
        queue.clone(),
        Arc::new(driver),
        WorkerConfig {
            tick_ms: 10,
            concurrency: 2,
            claim_batch: 10,
            stale_after_seconds: 600,
        },
    );
    Rig { db, queue, worker }
}

async fn rows_named(db: &DatabaseConnection, name: &str) -> Vec<queued_task::Model> {
    QueuedTask::find()
        .filter(queued_task::Column::TaskName.eq(name))
        .all(db)
        .await
        .unwrap()
}

#[tokio::test]
async fn ticks_walk_a_run_to_completion_and_leave_downstream_tasks_queued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STATS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"username": "dev", "total_seconds": 3600.0}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rig = rig(&server).await;
    let connection = insert_connection(&rig.db, Provider::WakaTime, "dev")
        .await
        .unwrap();
    rig.queue
        .enqueue(Task::Scrape(ScrapeTask::new(
            Provider::WakaTime,
            connection.id,
            JobId::generate(),
        )))
        .await
        .unwrap();

    // stats step, then the save step enqueued by the first
    for _ in 0..2 {
        let summary = rig.worker.tick().await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.succeeded, 1);
    }
    assert_eq!(rig.worker.tick().await.unwrap(), TickSummary::default());

    let scrape_rows = rows_named(&rig.db, Task::SCRAPE).await;
    assert_eq!(scrape_rows.len(), 2);
    assert!(scrape_rows.iter().all(|row| row.status == STATUS_SUCCEEDED));
    assert!(scrape_rows.iter().all(|row| row.attempts == 1));

    for name in [Task::SYNC_TIMELINE, Task::REGENERATE_PROFILE] {
        let rows = rows_named(&rig.db, name).await;
        assert_eq!(rows.len(), 1, "{name}");
        assert_eq!(rows[0].status, STATUS_QUEUED);
    }

    let reloaded = ConnectionRepository::new(rig.db.clone())
        .get_by_id(connection.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.score, Some(1.0));
    assert!(reloaded.last_scraped_at.is_some());
}

#[tokio::test]
async fn failed_step_is_recorded_on_the_row_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STATS_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let rig = rig(&server).await;
    let connection = insert_connection(&rig.db, Provider::WakaTime, "dev")
        .await
        .unwrap();
    rig.queue
        .enqueue(Task::Scrape(ScrapeTask::new(
            Provider::WakaTime,
            connection.id,
            JobId::generate(),
        )))
        .await
        .unwrap();

    let summary = rig.worker.tick().await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(rig.worker.tick().await.unwrap().claimed, 0);

    let rows = rows_named(&rig.db, Task::SCRAPE).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, STATUS_FAILED);
    let last_error = rows[0].last_error.clone().unwrap();
    assert_eq!(last_error["disposition"], "count_against_connection");

    let reloaded = ConnectionRepository::new(rig.db.clone())
        .get_by_id(connection.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.error_count, 1);
    assert!(
        !rig.queue
            .has_pending(Task::SCRAPE, connection.id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn task_for_a_deleted_connection_completes_quietly() {
    let server = MockServer::start().await;
    let rig = rig(&server).await;
    rig.queue
        .enqueue(Task::Scrape(ScrapeTask::new(
            Provider::WakaTime,
            Uuid::new_v4(),
            JobId::generate(),
        )))
        .await
        .unwrap();

    let summary = rig.worker.tick().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    let rows = rows_named(&rig.db, Task::SCRAPE).await;
    assert_eq!(rows[0].status, STATUS_SUCCEEDED);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn delayed_tasks_wait_for_their_run_at() {
    let server = MockServer::start().await;
    let rig = rig(&server).await;
    let connection = insert_connection(&rig.db, Provider::WakaTime, "dev")
        .await
        .unwrap();
    rig.queue
        .enqueue_after(
            Duration::from_secs(3600),
            Task::Scrape(ScrapeTask::new(
                Provider::WakaTime,
                connection.id,
                JobId::generate(),
            )),
        )
        .await
        .unwrap();

    assert_eq!(rig.worker.tick().await.unwrap().claimed, 0);
    assert!(
        rig.queue
            .has_pending(Task::SCRAPE, connection.id)
            .await
            .unwrap()
    );
}
