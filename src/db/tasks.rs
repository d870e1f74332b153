//! Task operations: insert, atomic claim, CAS-guarded status updates.
//!
//! Every mutation is a single `UPDATE … RETURNING` statement. The `WHERE`
//! clause carries the expected prior status and owner, so a worker whose
//! claim was lost (requeued, reclaimed, already terminal) gets `None` back
//! instead of overwriting someone else's state.

use chrono::Utc;
use opentelemetry::KeyValue;
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, info, warn};

use super::{Db, decode_opt_ts, decode_ts, encode_ts};
use crate::error::{Error, Result};
use crate::model::*;
use crate::strategy::ClaimStrategy;
use crate::telemetry::metrics;

const TASK_COLUMNS: &str = "id, task_type, parameters, status, priority, max_retries, retry_count, \
     claimed_by, created_at, claimed_at, started_at, completed_at, error_message, result";

/// Condition under which a failure still has retries left.
/// `?1` = the worker's default max_retries.
const RETRY_LEFT: &str = "retry_count + 1 < COALESCE(max_retries, ?1)";

impl Db {
    /// Insert a new queued task. Returns its id.
    pub async fn insert_task(&self, new: NewTask) -> Result<TaskId> {
        if new.task_type.trim().is_empty() {
            return Err(Error::InvalidTask("task_type must not be empty".to_string()));
        }

        let id = TaskId::new();
        let parameters = serde_json::to_string(&new.parameters)
            .map_err(|e| Error::InvalidTask(format!("unserializable parameters: {e}")))?;

        sqlx::query(
            "INSERT INTO tasks (id, task_type, parameters, status, priority, max_retries, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(&new.task_type)
        .bind(parameters)
        .bind(new.priority)
        .bind(new.max_retries.map(i64::from))
        .bind(encode_ts(Utc::now()))
        .execute(self.pool())
        .await?;

        metrics::tasks_inserted().add(1, &[KeyValue::new("task_type", new.task_type.clone())]);
        debug!(task_id = %id, task_type = %new.task_type, priority = new.priority, "task inserted");

        Ok(id)
    }

    /// Atomically claim the next queued task of `task_type`.
    ///
    /// The strategy's selection and the ownership update are one statement;
    /// SQLite serializes writers, so two callers never receive the same row.
    pub async fn claim_next(
        &self,
        task_type: &str,
        worker_id: &str,
        strategy: &ClaimStrategy,
    ) -> Result<Option<Task>> {
        self.claim_with_sample(task_type, worker_id, strategy, strategy.sample())
            .await
    }

    pub(crate) async fn claim_with_sample(
        &self,
        task_type: &str,
        worker_id: &str,
        strategy: &ClaimStrategy,
        sample: f64,
    ) -> Result<Option<Task>> {
        let sql = format!(
            "UPDATE tasks SET status = 'claimed', claimed_by = ?1, claimed_at = ?2
             WHERE id = ({selection}) AND status = 'queued'
             RETURNING {TASK_COLUMNS}",
            selection = strategy.selection_sql(),
        );

        let mut query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(worker_id)
            .bind(encode_ts(Utc::now()))
            .bind(task_type);
        if strategy.is_random() {
            query = query.bind(sample);
        }

        let Some(row) = query.fetch_optional(self.pool()).await? else {
            return Ok(None);
        };
        let task = row.try_into_task()?;

        metrics::tasks_claimed().add(
            1,
            &[
                KeyValue::new("task_type", task.task_type.clone()),
                KeyValue::new("strategy", strategy.to_string()),
            ],
        );
        debug!(task_id = %task.id, worker_id, %strategy, "task claimed");

        Ok(Some(task))
    }

    /// Claimed → Running. `None` if the caller no longer holds the claim.
    pub async fn mark_running(&self, id: TaskId, worker_id: &str) -> Result<Option<Task>> {
        let sql = format!(
            "UPDATE tasks SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'claimed' AND claimed_by = ?3
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(encode_ts(Utc::now()))
            .bind(id.to_string())
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?;

        let task = row.map(TaskRow::try_into_task).transpose()?;
        record_transition(task.as_ref(), id, Status::Claimed, Status::Running);
        Ok(task)
    }

    /// Running → Completed with the work function's payload.
    ///
    /// A second report for the same task is a no-op and returns `None`.
    pub async fn mark_completed(
        &self,
        id: TaskId,
        worker_id: &str,
        payload: serde_json::Value,
    ) -> Result<Option<Task>> {
        let result = serde_json::to_string(&TaskResult::success(payload))
            .map_err(|e| Error::Other(format!("unserializable result: {e}")))?;

        let sql = format!(
            "UPDATE tasks SET status = 'completed', completed_at = ?1, result = ?2, error_message = NULL
             WHERE id = ?3 AND status = 'running' AND claimed_by = ?4
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(encode_ts(Utc::now()))
            .bind(result)
            .bind(id.to_string())
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?;

        let task = row.map(TaskRow::try_into_task).transpose()?;
        record_transition(task.as_ref(), id, Status::Running, Status::Completed);
        if let Some(ref task) = task {
            record_outcome(task, "completed");
        }
        Ok(task)
    }

    /// Record a failure.
    ///
    /// Retryable failures of a running task bump `retry_count` and go back
    /// to Queued while retries remain, otherwise land in Failed. Non-retryable
    /// failures (including parameter validation of a claimed task) go
    /// straight to Failed without touching `retry_count`. The returned task's
    /// status tells the caller which happened; `None` means the caller no
    /// longer holds the claim.
    pub async fn mark_failed(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
        max_retries: u32,
    ) -> Result<Option<Task>> {
        let sql = if retryable {
            format!(
                "UPDATE tasks SET
                     retry_count = retry_count + 1,
                     status = CASE WHEN {RETRY_LEFT} THEN 'queued' ELSE 'failed' END,
                     claimed_by = CASE WHEN {RETRY_LEFT} THEN NULL ELSE claimed_by END,
                     claimed_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE claimed_at END,
                     started_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE started_at END,
                     completed_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE ?2 END,
                     error_message = ?3
                 WHERE id = ?4 AND status = 'running' AND claimed_by = ?5
                 RETURNING {TASK_COLUMNS}"
            )
        } else {
            format!(
                "UPDATE tasks SET status = 'failed', completed_at = ?2, error_message = ?3
                 WHERE id = ?4 AND status IN ('claimed', 'running') AND claimed_by = ?5
                 RETURNING {TASK_COLUMNS}"
            )
        };

        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(i64::from(max_retries))
            .bind(encode_ts(Utc::now()))
            .bind(error)
            .bind(id.to_string())
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?;

        let task = row.map(TaskRow::try_into_task).transpose()?;
        match task {
            Some(ref task) if task.status == Status::Queued => {
                record_outcome(task, "retried");
                info!(
                    task_id = %id,
                    retry_count = task.retry_count,
                    error,
                    "task failed, requeued for retry"
                );
            }
            Some(ref task) => {
                record_outcome(task, "failed");
                warn!(task_id = %id, retry_count = task.retry_count, retryable, error, "task failed");
            }
            None => {
                warn!(task_id = %id, worker_id, "failure not recorded: claim no longer held");
            }
        }
        Ok(task)
    }

    /// Operator action: put a claimed or running task back in the queue.
    ///
    /// Used to recover tasks orphaned by a crashed worker. `retry_count`
    /// and the last error are kept. Completed and failed tasks are terminal
    /// and return `None`.
    pub async fn requeue_task(&self, id: TaskId) -> Result<Option<Task>> {
        let sql = format!(
            "UPDATE tasks SET status = 'queued', claimed_by = NULL, claimed_at = NULL,
                              started_at = NULL, completed_at = NULL
             WHERE id = ?1 AND status IN ('claimed', 'running')
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;

        let task = row.map(TaskRow::try_into_task).transpose()?;
        if task.is_some() {
            info!(task_id = %id, "task requeued by operator");
        }
        Ok(task)
    }

    /// Return claims held by workers whose heartbeat is older than
    /// `stale_after` to the queue.
    ///
    /// Counts as a transient failure: `retry_count` is bumped and tasks
    /// with no retries left become Failed.
    pub async fn reclaim_stale(
        &self,
        stale_after: std::time::Duration,
        max_retries: u32,
    ) -> Result<Vec<Task>> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::Config(format!("stale threshold out of range: {e}")))?;
        let now = Utc::now();
        let cutoff = now - stale_after;

        let sql = format!(
            "UPDATE tasks SET
                 retry_count = retry_count + 1,
                 status = CASE WHEN {RETRY_LEFT} THEN 'queued' ELSE 'failed' END,
                 claimed_by = CASE WHEN {RETRY_LEFT} THEN NULL ELSE claimed_by END,
                 claimed_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE claimed_at END,
                 started_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE started_at END,
                 completed_at = CASE WHEN {RETRY_LEFT} THEN NULL ELSE ?2 END,
                 error_message = 'claim reclaimed: worker ' || claimed_by || ' stopped heartbeating'
             WHERE status IN ('claimed', 'running')
               AND NOT EXISTS (
                   SELECT 1 FROM workers w
                   WHERE w.worker_id = tasks.claimed_by AND w.last_heartbeat_at >= ?3
               )
             RETURNING {TASK_COLUMNS}"
        );

        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(i64::from(max_retries))
            .bind(encode_ts(now))
            .bind(encode_ts(cutoff))
            .fetch_all(self.pool())
            .await?;

        let tasks = rows
            .into_iter()
            .map(TaskRow::try_into_task)
            .collect::<Result<Vec<_>>>()?;
        for task in &tasks {
            record_outcome(task, if task.status == Status::Queued { "retried" } else { "failed" });
            warn!(task_id = %task.id, status = %task.status, "stale claim reclaimed");
        }
        Ok(tasks)
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    /// Tasks whose id starts with `prefix`, newest first.
    pub async fn find_tasks_by_prefix(&self, prefix: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id LIKE ?1 || '%' ORDER BY created_at DESC, seq DESC LIMIT 10"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(prefix.to_ascii_lowercase())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Look up a task by full id or unique id prefix.
    ///
    /// `NotFound` when nothing matches; `InvalidTask` when a prefix is
    /// ambiguous.
    pub async fn resolve_task(&self, id_or_prefix: &str) -> Result<Task> {
        if let Ok(id) = id_or_prefix.parse::<TaskId>() {
            return self
                .get_task(id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()));
        }

        let mut matches = self.find_tasks_by_prefix(id_or_prefix).await?;
        match matches.len() {
            0 => Err(Error::NotFound(format!("no task matching prefix '{id_or_prefix}'"))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::InvalidTask(format!(
                "{n} tasks match prefix '{id_or_prefix}', be more specific"
            ))),
        }
    }

    /// List tasks matching a filter, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.clone());
        }
        if let Some(ref worker_id) = filter.claimed_by {
            qb.push(" AND claimed_by = ").push_bind(worker_id.clone());
        }
        qb.push(" ORDER BY created_at DESC, seq DESC LIMIT ")
            .push_bind(filter.limit);

        let rows = qb
            .build_query_as::<TaskRow>()
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

fn record_transition(task: Option<&Task>, id: TaskId, from: Status, to: Status) {
    match task {
        Some(task) => {
            metrics::task_state_transitions().add(
                1,
                &[
                    KeyValue::new("task_type", task.task_type.clone()),
                    KeyValue::new("from", from.as_str()),
                    KeyValue::new("to", to.as_str()),
                ],
            );
        }
        None => {
            debug!(task_id = %id, %from, %to, "transition not applied");
        }
    }
}

fn record_outcome(task: &Task, outcome: &'static str) {
    metrics::task_outcomes().add(
        1,
        &[
            KeyValue::new("task_type", task.task_type.clone()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    parameters: String,
    status: String,
    priority: i64,
    max_retries: Option<i64>,
    retry_count: i64,
    claimed_by: Option<String>,
    created_at: String,
    claimed_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    result: Option<String>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        let parameters = serde_json::from_str(&self.parameters)
            .map_err(|e| Error::Other(format!("task {}: bad parameters json: {e}", self.id)))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<TaskResult>)
            .transpose()
            .map_err(|e| Error::Other(format!("task {}: bad result json: {e}", self.id)))?;

        Ok(Task {
            id: self.id.parse()?,
            task_type: self.task_type,
            parameters,
            status: self.status.parse()?,
            priority: self.priority as i32,
            max_retries: self.max_retries.map(|n| n as u32),
            retry_count: self.retry_count as u32,
            claimed_by: self.claimed_by,
            created_at: decode_ts("created_at", &self.created_at)?,
            claimed_at: decode_opt_ts("claimed_at", self.claimed_at)?,
            started_at: decode_opt_ts("started_at", self.started_at)?,
            completed_at: decode_opt_ts("completed_at", self.completed_at)?,
            error_message: self.error_message,
            result,
        })
    }
}
