//! Task execution span helpers.

use tracing::Span;

use crate::model::{Status, TaskId};

/// Start a span covering one claimed task, from claim to report.
///
/// `task.status` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_task_span(task_type: &str, task_id: &TaskId, worker_id: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.type" = task_type,
        "task.id" = %task_id,
        "worker.id" = worker_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the task span and emit an event for it.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("task.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
