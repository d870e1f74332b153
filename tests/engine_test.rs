//! Integration tests for the worker engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskclaim::config::WorkerConfig;
use taskclaim::db::Db;
use taskclaim::engine::{Cycle, ManualClock, Outcome, Worker, WorkerState};
use taskclaim::error::Result;
use taskclaim::model::*;
use taskclaim::registry::{CompletionReport, RegistrySync, RegistrySyncError, TaskTypeRegistration};
use taskclaim::work::{ParamKind, ParamSchema, ResultSink, WorkError, WorkFunction, WorkRegistry};
use tokio::sync::watch;

async fn test_db() -> Db {
    let db = Db::in_memory().await.expect("in-memory db");
    db.migrate().await.expect("migrate");
    db
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        ..WorkerConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Work functions
// ---------------------------------------------------------------------------

/// Returns a title for `{"id": …}` parameters.
struct FetchTitle;

#[async_trait]
impl WorkFunction for FetchTitle {
    fn schema(&self) -> ParamSchema {
        ParamSchema::new().required("id", ParamKind::String)
    }

    async fn execute(&self, _params: &Value) -> std::result::Result<Value, WorkError> {
        Ok(json!({ "title": "y" }))
    }
}

/// Fails every call with the configured error and counts calls.
struct Failing {
    error: WorkError,
    calls: Arc<AtomicUsize>,
}

impl Failing {
    fn new(error: WorkError) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                error,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl WorkFunction for Failing {
    fn schema(&self) -> ParamSchema {
        ParamSchema::new().required("id", ParamKind::String)
    }

    async fn execute(&self, _params: &Value) -> std::result::Result<Value, WorkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

struct Sleepy(Duration);

#[async_trait]
impl WorkFunction for Sleepy {
    async fn execute(&self, _params: &Value) -> std::result::Result<Value, WorkError> {
        tokio::time::sleep(self.0).await;
        Ok(json!({ "slept_ms": self.0.as_millis() as u64 }))
    }
}

/// Simulates an operator requeueing the task while it runs.
struct RequeuedMidway {
    db: Db,
}

#[async_trait]
impl WorkFunction for RequeuedMidway {
    async fn execute(&self, _params: &Value) -> std::result::Result<Value, WorkError> {
        let running = self
            .db
            .list_tasks(&TaskFilter::default().status(Status::Running))
            .await
            .map_err(|e| WorkError::Permanent(e.to_string()))?;
        for task in running {
            self.db
                .requeue_task(task.id)
                .await
                .map_err(|e| WorkError::Permanent(e.to_string()))?;
        }
        Ok(json!({}))
    }
}

// ---------------------------------------------------------------------------
// Registry and sink doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingRegistry {
    fail_register: bool,
    fail_report: bool,
    registrations: Mutex<Vec<TaskTypeRegistration>>,
    reports: Mutex<Vec<CompletionReport>>,
}

#[async_trait]
impl RegistrySync for RecordingRegistry {
    async fn register_task_type(
        &self,
        registration: &TaskTypeRegistration,
    ) -> std::result::Result<(), RegistrySyncError> {
        self.registrations.lock().unwrap().push(registration.clone());
        if self.fail_register {
            return Err(RegistrySyncError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn report_completion(
        &self,
        report: &CompletionReport,
    ) -> std::result::Result<(), RegistrySyncError> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail_report {
            return Err(RegistrySyncError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    saved: Mutex<Vec<(TaskId, Value)>>,
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn save_result(&self, task_id: TaskId, payload: &Value) -> Result<()> {
        self.saved.lock().unwrap().push((task_id, payload.clone()));
        Ok(())
    }
}

async fn drain(worker: &mut Worker) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    loop {
        match worker.poll_once().await {
            Cycle::Processed { outcome, .. } => outcomes.push(outcome),
            Cycle::Idle { .. } => return outcomes,
            Cycle::StoreUnavailable { .. } => panic!("store unavailable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_fifo_completion() {
    let db = test_db().await;
    let id = db
        .insert_task(
            NewTask::new("fetch")
                .parameters(json!({ "id": "x" }))
                .priority(0),
        )
        .await
        .unwrap();

    let sink = Arc::new(RecordingSink::default());
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap()
    .with_sink(sink.clone());

    let cycle = worker.poll_once().await;
    assert_eq!(
        cycle,
        Cycle::Processed {
            task_id: id,
            outcome: Outcome::Completed
        }
    );

    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Completed);
    assert_eq!(task.result.unwrap().payload.unwrap()["title"], "y");
    assert_eq!(task.claimed_by.as_deref(), Some("test-worker"));
    assert!(task.claimed_at.is_some());
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());

    let saved = sink.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, id);

    assert_eq!(worker.info().tasks_processed, 1);
    let heartbeat = db.get_worker("test-worker").await.unwrap().unwrap();
    assert!(heartbeat.last_heartbeat_at >= heartbeat.started_at);
}

#[tokio::test]
async fn retry_exhaustion_lands_in_failed() {
    let db = test_db().await;
    let id = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();

    let (work, calls) = Failing::new(WorkError::Transient("rate limited".into()));
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", work),
        WorkerConfig {
            max_retries: 3,
            ..test_config()
        },
    )
    .unwrap();

    let outcomes = drain(&mut worker).await;
    assert_eq!(
        outcomes,
        vec![Outcome::Retrying, Outcome::Retrying, Outcome::Failed]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.error_message.unwrap().contains("rate limited"));
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let db = test_db().await;
    let id = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "wrong": 1 })))
        .await
        .unwrap();

    let (work, calls) = Failing::new(WorkError::Transient("unreachable".into()));
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", work),
        test_config(),
    )
    .unwrap();

    assert_eq!(drain(&mut worker).await, vec![Outcome::Failed]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.started_at.is_none());
    assert!(task.error_message.unwrap().starts_with("invalid parameters"));
}

#[tokio::test]
async fn permanent_error_fails_immediately() {
    let db = test_db().await;
    let id = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();

    let (work, calls) = Failing::new(WorkError::Permanent("unsupported source".into()));
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", work),
        test_config(),
    )
    .unwrap();

    assert_eq!(drain(&mut worker).await, vec![Outcome::Failed]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.retry_count, 0);
    assert_eq!(worker.info().tasks_failed, 1);
}

#[tokio::test]
async fn timeout_takes_the_retry_path() {
    let db = test_db().await;
    let id = db.insert_task(NewTask::new("slow")).await.unwrap();

    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("slow", Sleepy(Duration::from_secs(30))),
        WorkerConfig {
            task_timeout: Some(Duration::from_millis(50)),
            ..test_config()
        },
    )
    .unwrap();

    let cycle = worker.poll_once().await;
    assert_eq!(
        cycle,
        Cycle::Processed {
            task_id: id,
            outcome: Outcome::Retrying
        }
    );
    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Queued);
    assert_eq!(task.retry_count, 1);
    assert!(task.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn lost_claim_is_not_overwritten() {
    let db = test_db().await;
    let id = db.insert_task(NewTask::new("fetch")).await.unwrap();

    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", RequeuedMidway { db: db.clone() }),
        test_config(),
    )
    .unwrap();

    assert_eq!(
        worker.poll_once().await,
        Cycle::Processed {
            task_id: id,
            outcome: Outcome::Lost
        }
    );
    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Queued);
    assert!(task.result.is_none());
}

#[tokio::test]
async fn claims_rotate_across_task_types() {
    let db = test_db().await;
    let a = db.insert_task(NewTask::new("a")).await.unwrap();
    db.insert_task(NewTask::new("a")).await.unwrap();
    let b = db.insert_task(NewTask::new("b")).await.unwrap();

    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new()
            .with("a", Sleepy(Duration::ZERO))
            .with("b", Sleepy(Duration::ZERO)),
        test_config(),
    )
    .unwrap();

    let first = worker.poll_once().await;
    let second = worker.poll_once().await;
    assert!(matches!(first, Cycle::Processed { task_id, .. } if task_id == a));
    assert!(matches!(second, Cycle::Processed { task_id, .. } if task_id == b));
}

#[tokio::test]
async fn unknown_configured_task_type_is_rejected() {
    let db = test_db().await;
    let result = Worker::new(
        db,
        WorkRegistry::new().with("fetch", FetchTitle),
        WorkerConfig {
            task_types: vec!["render".to_string()],
            ..test_config()
        },
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn zero_intervals_are_rejected_at_construction() {
    let db = test_db().await;
    for config in [
        WorkerConfig {
            heartbeat_interval: Duration::ZERO,
            ..test_config()
        },
        WorkerConfig {
            poll_interval: Duration::ZERO,
            ..test_config()
        },
    ] {
        let result = Worker::new(
            db.clone(),
            WorkRegistry::new().with("fetch", FetchTitle),
            config,
        );
        assert!(matches!(result, Err(taskclaim::error::Error::Config(_))));
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_failures_back_off_like_empty_polls() {
    let db = test_db().await;
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap();
    db.close().await;

    assert_eq!(
        worker.poll_once().await,
        Cycle::StoreUnavailable {
            delay: Duration::from_secs(5)
        }
    );
    assert_eq!(
        worker.poll_once().await,
        Cycle::StoreUnavailable {
            delay: Duration::from_millis(7500)
        }
    );
}

#[tokio::test]
async fn empty_polls_back_off_geometrically_and_reset_on_claim() {
    let db = test_db().await;
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap();

    let mut delays = Vec::new();
    for _ in 0..10 {
        delays.push(worker.poll_once().await.delay().unwrap().as_secs_f64());
    }
    assert_eq!(&delays[..4], &[5.0, 7.5, 11.25, 16.875]);
    assert!(delays.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(delays[9], 60.0);

    db.insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();
    assert!(worker.poll_once().await.delay().is_none());
    assert_eq!(worker.poll_once().await.delay(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn run_sleeps_through_the_clock_until_shutdown() {
    let db = test_db().await;
    let clock = Arc::new(ManualClock::default());
    let mut worker = Worker::new(
        db,
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap()
    .with_clock(clock.clone());
    let mut states = worker.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    while clock.sleeps().len() < 6 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let sleeps = clock.sleeps();
    assert_eq!(sleeps[0], Duration::from_secs(5));
    assert_eq!(sleeps[1], Duration::from_millis(7500));
    assert_eq!(sleeps[2], Duration::from_millis(11250));
    assert!(sleeps.iter().all(|d| *d <= Duration::from_secs(60)));
    assert_eq!(*states.borrow_and_update(), WorkerState::ShuttingDown);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_the_in_flight_task() {
    let db = test_db().await;
    let id = db.insert_task(NewTask::new("slow")).await.unwrap();

    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("slow", Sleepy(Duration::from_millis(200))),
        test_config(),
    )
    .unwrap();
    let mut states = worker.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    states
        .wait_for(|s| *s == WorkerState::Executing)
        .await
        .unwrap();
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let task = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Completed);
}

// ---------------------------------------------------------------------------
// Registry sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registry_receives_registrations_and_terminal_reports() {
    let db = test_db().await;
    let ok = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();
    let bad = db
        .insert_task(NewTask::new("fetch").parameters(json!({})))
        .await
        .unwrap();

    let registry = Arc::new(RecordingRegistry::default());
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap()
    .with_registry(registry.clone());

    assert!(worker.register_task_types().await);
    drain(&mut worker).await;

    let registrations = registry.registrations.lock().unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].name, "fetch");
    assert_eq!(registrations[0].schema["required"], json!(["id"]));

    let reports = registry.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    let ok_report = reports.iter().find(|r| r.task_id == ok).unwrap();
    assert!(ok_report.success);
    assert_eq!(ok_report.result, Some(json!({ "title": "y" })));
    let bad_report = reports.iter().find(|r| r.task_id == bad).unwrap();
    assert!(!bad_report.success);
    assert!(bad_report.error.is_some());
}

#[tokio::test]
async fn registration_failure_disables_sync_without_affecting_tasks() {
    let db = test_db().await;
    let id = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();

    let registry = Arc::new(RecordingRegistry {
        fail_register: true,
        ..Default::default()
    });
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap()
    .with_registry(registry.clone());

    assert!(!worker.register_task_types().await);
    assert!(!worker.registry_sync_enabled());

    assert_eq!(drain(&mut worker).await, vec![Outcome::Completed]);
    assert_eq!(
        db.get_task(id).await.unwrap().unwrap().status,
        Status::Completed
    );
    assert!(registry.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn report_failure_keeps_local_outcome() {
    let db = test_db().await;
    let id = db
        .insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();

    let registry = Arc::new(RecordingRegistry {
        fail_report: true,
        ..Default::default()
    });
    let mut worker = Worker::new(
        db.clone(),
        WorkRegistry::new().with("fetch", FetchTitle),
        test_config(),
    )
    .unwrap()
    .with_registry(registry.clone());

    assert_eq!(drain(&mut worker).await, vec![Outcome::Completed]);
    assert_eq!(registry.reports.lock().unwrap().len(), 1);
    assert!(worker.registry_sync_enabled());
    assert_eq!(
        db.get_task(id).await.unwrap().unwrap().status,
        Status::Completed
    );
}

#[tokio::test]
async fn sync_disabled_by_config_sends_nothing() {
    let db = test_db().await;
    db.insert_task(NewTask::new("fetch").parameters(json!({ "id": "x" })))
        .await
        .unwrap();

    let registry = Arc::new(RecordingRegistry::default());
    let mut worker = Worker::new(
        db,
        WorkRegistry::new().with("fetch", FetchTitle),
        WorkerConfig {
            enable_registry_sync: false,
            ..test_config()
        },
    )
    .unwrap()
    .with_registry(registry.clone());

    assert!(!worker.register_task_types().await);
    drain(&mut worker).await;
    assert!(registry.registrations.lock().unwrap().is_empty());
    assert!(registry.reports.lock().unwrap().is_empty());
}
