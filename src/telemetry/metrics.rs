//! Metric instrument factories for taskclaim.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskclaim"` meter; with no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskclaim")
}

/// Counter: tasks inserted by producers.
/// Labels: `task_type`.
pub fn tasks_inserted() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.inserted")
        .with_description("Number of tasks inserted")
        .build()
}

/// Counter: successful claims.
/// Labels: `task_type`, `strategy`.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.claimed")
        .with_description("Number of tasks claimed by workers")
        .build()
}

/// Counter: task state transitions applied by the store.
/// Labels: `task_type`, `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: terminal or retry outcomes.
/// Labels: `task_type`, `outcome` ("completed" | "failed" | "retried").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.outcomes")
        .with_description("Number of task outcomes by kind")
        .build()
}

/// Counter: polls that found nothing to claim.
/// Labels: `worker_id`.
pub fn claim_empty() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.claim_empty")
        .with_description("Number of polls that found no queued task")
        .build()
}

/// Counter: store errors seen by the worker loop.
/// Labels: `operation`.
pub fn storage_errors() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.storage_errors")
        .with_description("Number of queue store errors seen by workers")
        .build()
}

/// Counter: registry sync calls that failed.
/// Labels: `operation` ("register" | "report").
pub fn registry_failures() -> Counter<u64> {
    meter()
        .u64_counter("taskclaim.tasks.registry_failures")
        .with_description("Number of failed registry sync calls")
        .build()
}

/// Histogram: work function wall time in milliseconds.
/// Labels: `task_type`, `outcome`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskclaim.task.duration_ms")
        .with_description("Work function execution time in milliseconds")
        .with_unit("ms")
        .build()
}
