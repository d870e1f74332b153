//! Worker loop: poll → claim → validate → execute → report → backoff.
//!
//! A worker holds at most one task at a time. It never shares in-memory
//! state with other workers; the queue store's single-statement claim is
//! what keeps two workers off the same task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, warn};

use super::backoff::Backoff;
use super::clock::{Clock, SystemClock};
use super::state::WorkerState;
use crate::config::WorkerConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Status, Task, TaskId, WorkerInfo};
use crate::registry::{CompletionReport, RegistrySync, TaskTypeRegistration};
use crate::strategy::ClaimStrategy;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::work::{ResultSink, WorkError, WorkFunction, WorkRegistry};

/// What one call to [`Worker::poll_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Claimed a task and drove it to an outcome.
    Processed { task_id: TaskId, outcome: Outcome },
    /// Nothing queued for any of the worker's task types.
    Idle { delay: Duration },
    /// The store failed; the worker backs off the same way as when idle.
    StoreUnavailable { delay: Duration },
}

impl Cycle {
    /// How long the loop should sleep before the next poll.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Cycle::Processed { .. } => None,
            Cycle::Idle { delay } | Cycle::StoreUnavailable { delay } => Some(*delay),
        }
    }
}

/// Where a claimed task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Transient failure with retries left; back in the queue.
    Retrying,
    /// Terminally failed.
    Failed,
    /// The claim was gone by the time the worker reported (requeued or
    /// reclaimed by someone else). Nothing was written.
    Lost,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Retrying => "retrying",
            Outcome::Failed => "failed",
            Outcome::Lost => "lost",
        }
    }
}

pub struct Worker {
    db: Db,
    work: Arc<WorkRegistry>,
    config: WorkerConfig,
    strategy: ClaimStrategy,
    task_types: Vec<String>,
    next_type: usize,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    registry: Option<Arc<dyn RegistrySync>>,
    registry_enabled: AtomicBool,
    sink: Option<Arc<dyn ResultSink>>,
    info: WorkerInfo,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Build a worker for every task type in `work`, or only the ones
    /// listed in `config.task_types`.
    pub fn new(db: Db, work: WorkRegistry, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let strategy = config.strategy()?;

        let task_types = if config.task_types.is_empty() {
            work.task_types()
        } else {
            if let Some(missing) = config.task_types.iter().find(|t| work.get(t).is_none()) {
                return Err(Error::Config(format!(
                    "no work function registered for task type {missing}"
                )));
            }
            config.task_types.clone()
        };
        if task_types.is_empty() {
            return Err(Error::Config("worker has no task types to claim".to_string()));
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Self {
            backoff: Backoff::new(
                config.poll_interval,
                config.backoff_multiplier,
                config.max_backoff,
            ),
            info: WorkerInfo::new(config.worker_id.clone(), clock.now()),
            registry_enabled: AtomicBool::new(config.enable_registry_sync),
            db,
            work: Arc::new(work),
            strategy,
            task_types,
            next_type: 0,
            clock,
            registry: None,
            sink: None,
            state,
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.info = WorkerInfo::new(self.config.worker_id.clone(), clock.now());
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistrySync>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.info.worker_id
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn task_types(&self) -> &[String] {
        &self.task_types
    }

    /// Observe lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Whether completion reports still go to the registry.
    pub fn registry_sync_enabled(&self) -> bool {
        self.registry.is_some() && self.registry_enabled.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A task in flight when shutdown is signalled is driven to its outcome
    /// before the loop exits; only the backoff sleep is interrupted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.info.worker_id,
            task_types = ?self.task_types,
            strategy = %self.strategy,
            "worker started"
        );

        self.beat().await;
        self.register_task_types().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle = self.poll_once().await;
            let Some(delay) = cycle.delay() else {
                continue;
            };

            if *shutdown.borrow() {
                break;
            }
            self.set_state(WorkerState::Backoff);
            tokio::select! {
                _ = self.clock.sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::ShuttingDown);
        self.beat().await;
        info!(
            worker_id = %self.info.worker_id,
            tasks_processed = self.info.tasks_processed,
            tasks_failed = self.info.tasks_failed,
            "worker stopped"
        );
        Ok(())
    }

    /// Register every task type with the registry. The first failure turns
    /// registry sync off for the rest of the process.
    pub async fn register_task_types(&self) -> bool {
        let Some(ref registry) = self.registry else {
            return false;
        };
        if !self.registry_enabled.load(Ordering::Relaxed) {
            return false;
        }

        for task_type in &self.task_types {
            let Some(function) = self.work.get(task_type) else {
                continue;
            };
            let registration = TaskTypeRegistration {
                name: task_type.clone(),
                version: function.version().to_string(),
                schema: function.schema().to_json(),
            };
            if let Err(e) = registry.register_task_type(&registration).await {
                metrics::registry_failures().add(1, &[KeyValue::new("operation", "register")]);
                warn!(
                    task_type = %task_type,
                    error = %e,
                    "registry registration failed, disabling registry sync"
                );
                self.registry_enabled.store(false, Ordering::Relaxed);
                return false;
            }
            debug!(task_type = %task_type, "task type registered");
        }
        true
    }

    // -----------------------------------------------------------------------
    // One cycle
    // -----------------------------------------------------------------------

    /// Heartbeat, claim at most one task, and drive it to an outcome.
    pub async fn poll_once(&mut self) -> Cycle {
        self.set_state(WorkerState::Polling);
        self.beat().await;
        self.reclaim_stale().await;

        let task = match self.claim().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                metrics::claim_empty().add(
                    1,
                    &[KeyValue::new("worker_id", self.info.worker_id.clone())],
                );
                let delay = self.backoff.next_delay();
                debug!(worker_id = %self.info.worker_id, ?delay, "no queued tasks, backing off");
                return Cycle::Idle { delay };
            }
            Err(e) => return self.store_failure("claim", &e),
        };

        self.backoff.reset();
        let task_id = task.id;
        let span = start_task_span(&task.task_type, &task_id, &self.info.worker_id);

        let outcome = self.process(task, &span).instrument(span.clone()).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // The task stays wherever the last successful write left it.
                error!(task_id = %task_id, error = %e, "store failure while reporting task");
                return self.store_failure("report", &e);
            }
        };

        self.info.tasks_processed += 1;
        if matches!(outcome, Outcome::Failed | Outcome::Retrying) {
            self.info.tasks_failed += 1;
        }
        Cycle::Processed { task_id, outcome }
    }

    fn store_failure(&mut self, operation: &'static str, e: &Error) -> Cycle {
        metrics::storage_errors().add(1, &[KeyValue::new("operation", operation)]);
        let delay = self.backoff.next_delay();
        error!(
            worker_id = %self.info.worker_id,
            operation,
            error = %e,
            ?delay,
            "queue store error, backing off"
        );
        Cycle::StoreUnavailable { delay }
    }

    /// Try each task type once, starting after the one that last matched.
    async fn claim(&mut self) -> Result<Option<Task>> {
        let n = self.task_types.len();
        for offset in 0..n {
            let idx = (self.next_type + offset) % n;
            let task = self
                .db
                .claim_next(&self.task_types[idx], &self.info.worker_id, &self.strategy)
                .await?;
            if task.is_some() {
                self.next_type = (idx + 1) % n;
                return Ok(task);
            }
        }
        Ok(None)
    }

    async fn process(&mut self, task: Task, span: &tracing::Span) -> Result<Outcome> {
        let worker_id = self.info.worker_id.clone();
        self.set_state(WorkerState::Claimed);
        record_state_transition(span, Status::Queued, Status::Claimed);

        let Some(function) = self.work.get(&task.task_type).cloned() else {
            // Only registered types are claimed, so this means the registry
            // changed under us.
            let error = format!("no work function for task type {}", task.task_type);
            return self
                .fail(&task, &worker_id, Status::Claimed, WorkError::Permanent(error), span)
                .await;
        };

        if let Err(e) = function.schema().validate(&task.parameters) {
            warn!(task_id = %task.id, error = %e, "parameters rejected");
            return self.fail(&task, &worker_id, Status::Claimed, e, span).await;
        }

        if self.db.mark_running(task.id, &worker_id).await?.is_none() {
            warn!(task_id = %task.id, "claim lost before start");
            return Ok(Outcome::Lost);
        }
        record_state_transition(span, Status::Claimed, Status::Running);

        self.set_state(WorkerState::Executing);
        let started = Instant::now();
        let result = self.execute(function.as_ref(), &task.parameters).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.set_state(WorkerState::Reporting);
        let outcome = match result {
            Ok(payload) => self.complete(&task, &worker_id, payload, span).await?,
            Err(e) => self.fail(&task, &worker_id, Status::Running, e, span).await?,
        };

        metrics::task_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("task_type", task.task_type.clone()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            outcome = outcome.as_str(),
            duration_ms = elapsed_ms as u64,
            "task processed"
        );
        Ok(outcome)
    }

    /// Run the work function under the hard timeout, heartbeating while it
    /// runs.
    async fn execute(
        &mut self,
        function: &dyn WorkFunction,
        params: &Value,
    ) -> std::result::Result<Value, WorkError> {
        let timeout = self.config.task_timeout;
        let call = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, function.execute(params))
                    .await
                    .unwrap_or_else(|_| {
                        Err(WorkError::Transient(format!(
                            "timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => function.execute(params).await,
            }
        };
        tokio::pin!(call);

        let mut keepalive = tokio::time::interval(self.config.heartbeat_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the cycle already heartbeated.
        keepalive.tick().await;

        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = keepalive.tick() => self.beat().await,
            }
        }
    }

    async fn complete(
        &self,
        task: &Task,
        worker_id: &str,
        payload: Value,
        span: &tracing::Span,
    ) -> Result<Outcome> {
        let Some(done) = self
            .db
            .mark_completed(task.id, worker_id, payload.clone())
            .await?
        else {
            warn!(task_id = %task.id, "claim lost before completion");
            return Ok(Outcome::Lost);
        };
        record_state_transition(span, Status::Running, Status::Completed);

        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.save_result(done.id, &payload).await {
                warn!(task_id = %done.id, error = %e, "result sink failed");
            }
        }

        self.report(CompletionReport {
            task_id: done.id,
            worker_id: worker_id.to_string(),
            success: true,
            result: Some(payload),
            error: None,
        })
        .await;
        Ok(Outcome::Completed)
    }

    async fn fail(
        &self,
        task: &Task,
        worker_id: &str,
        from: Status,
        error: WorkError,
        span: &tracing::Span,
    ) -> Result<Outcome> {
        let message = error.to_string();

        let Some(updated) = self
            .db
            .mark_failed(
                task.id,
                worker_id,
                &message,
                error.is_retryable(),
                self.config.max_retries,
            )
            .await?
        else {
            return Ok(Outcome::Lost);
        };
        record_state_transition(span, from, updated.status);

        if updated.status == Status::Queued {
            return Ok(Outcome::Retrying);
        }

        self.report(CompletionReport {
            task_id: updated.id,
            worker_id: worker_id.to_string(),
            success: false,
            result: None,
            error: Some(message),
        })
        .await;
        Ok(Outcome::Failed)
    }

    async fn report(&self, report: CompletionReport) {
        if !self.registry_sync_enabled() {
            return;
        }
        let Some(ref registry) = self.registry else {
            return;
        };
        if let Err(e) = registry.report_completion(&report).await {
            metrics::registry_failures().add(1, &[KeyValue::new("operation", "report")]);
            warn!(task_id = %report.task_id, error = %e, "registry completion report failed");
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Best-effort heartbeat. Failures are logged only.
    async fn beat(&mut self) {
        self.info.last_heartbeat_at = self.clock.now();
        if let Err(e) = self.db.heartbeat(&self.info).await {
            metrics::storage_errors().add(1, &[KeyValue::new("operation", "heartbeat")]);
            warn!(worker_id = %self.info.worker_id, error = %e, "heartbeat failed");
        }
    }

    async fn reclaim_stale(&self) {
        let Some(threshold) = self.config.reclaim_stale_after else {
            return;
        };
        match self.db.reclaim_stale(threshold, self.config.max_retries).await {
            Ok(tasks) if !tasks.is_empty() => {
                info!(count = tasks.len(), "reclaimed stale claims");
            }
            Ok(_) => {}
            Err(e) => {
                metrics::storage_errors().add(1, &[KeyValue::new("operation", "reclaim")]);
                warn!(error = %e, "stale reclaim failed");
            }
        }
    }
}
