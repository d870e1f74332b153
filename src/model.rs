//! Core data model.
//!
//! A task is a unit of work pulled from the shared backlog. It has a type,
//! opaque parameters, a priority, ownership metadata, and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at insert.
    pub id: TaskId,

    /// What kind of work this is (e.g., "content.fetch.subreddit").
    /// Determines which work function handles it.
    pub task_type: String,

    /// Arbitrary parameters for the work function. The engine doesn't interpret these.
    pub parameters: serde_json::Value,

    /// Current lifecycle status.
    pub status: Status,

    /// Priority. Higher = more urgent. Only the Priority and
    /// WeightedRandom strategies look at it.
    pub priority: i32,

    /// Per-task retry limit. None = use the worker's configured `max_retries`.
    pub max_retries: Option<u32>,

    /// Number of transient failures recorded so far.
    pub retry_count: u32,

    /// Worker holding the claim. Null only while Queued; terminal tasks
    /// keep the worker that finished them.
    pub claimed_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last failure message.
    pub error_message: Option<String>,

    /// Set on completion.
    pub result: Option<TaskResult>,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::InvalidTask(format!("bad task id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker.
    Queued,
    /// A worker owns it but has not started executing.
    Claimed,
    /// Work function in progress.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Failed for good. Terminal.
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Queued,
        Status::Claimed,
        Status::Running,
        Status::Completed,
        Status::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Claimed)
                | (Claimed, Running)
                | (Claimed, Failed)     // parameters failed validation
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)     // retry recorded with the failure
                | (Claimed, Queued)     // operator requeue
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Claimed => "claimed",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Status::Queued),
            "claimed" => Ok(Status::Claimed),
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Result of running a work function. Stored on the task when it completes
/// and handed to the registry when reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Arbitrary result data. Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Heartbeat row for a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            started_at: now,
            last_heartbeat_at: now,
            tasks_processed: 0,
            tasks_failed: 0,
        }
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat_at
    }

    /// A worker is stale once its heartbeat is older than `threshold`.
    /// Used for observability only.
    pub fn is_stale(&self, threshold: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => self.heartbeat_age(now) > threshold,
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder + filters
// ---------------------------------------------------------------------------

/// Builder for new tasks. The producer-facing API.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) task_type: String,
    pub(crate) parameters: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: serde_json::json!({}),
            priority: 0,
            max_retries: None,
        }
    }

    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

/// Filter for `Db::list_tasks`.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<Status>,
    pub task_type: Option<String>,
    pub claimed_by: Option<String>,
    pub limit: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            claimed_by: None,
            limit: 100,
        }
    }
}

impl TaskFilter {
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn claimed_by(mut self, worker_id: impl Into<String>) -> Self {
        self.claimed_by = Some(worker_id.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Number of tasks of one type in one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub task_type: String,
    pub status: Status,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub failed: u64,
    /// Total retries recorded across all tasks.
    pub retried: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub info: WorkerInfo,
    pub stale: bool,
}

/// Snapshot for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: Vec<QueueDepth>,
    pub outcomes: OutcomeCounts,
    pub workers: Vec<WorkerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_follow_the_state_machine() {
        assert!(Status::Queued.can_transition_to(Status::Claimed));
        assert!(Status::Claimed.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Completed));
        assert!(Status::Running.can_transition_to(Status::Failed));
        assert!(Status::Running.can_transition_to(Status::Queued));
        assert!(Status::Claimed.can_transition_to(Status::Queued));

        assert!(!Status::Failed.can_transition_to(Status::Queued));

        assert!(!Status::Queued.can_transition_to(Status::Running));
        assert!(!Status::Queued.can_transition_to(Status::Completed));
        assert!(!Status::Completed.can_transition_to(Status::Queued));
        assert!(!Status::Completed.can_transition_to(Status::Failed));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in Status::ALL {
            let parsed: Status = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("dead".parse::<Status>().is_err());
    }

    #[test]
    fn stale_worker_detection() {
        let now = Utc::now();
        let mut info = WorkerInfo::new("w1", now);
        assert!(!info.is_stale(std::time::Duration::from_secs(30), now));

        info.last_heartbeat_at = now - chrono::Duration::seconds(31);
        assert!(info.is_stale(std::time::Duration::from_secs(30), now));
    }
}
