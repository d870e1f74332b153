//! Integration tests for telemetry initialization and span helpers.

use taskclaim::model::{Status, TaskId};
use taskclaim::telemetry::{TelemetryConfig, init_telemetry, metrics, task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // attempt returns Err instead of panicking.
    let guard = init_telemetry(TelemetryConfig {
        service_name: "taskclaim-test".to_string(),
        ..TelemetryConfig::default()
    });
    if let Ok(guard) = guard {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transitions() {
    let id = TaskId::new();
    let span = task::start_task_span("fetch", &id, "w1");
    task::record_state_transition(&span, Status::Queued, Status::Claimed);
    task::record_state_transition(&span, Status::Claimed, Status::Running);
}

#[test]
fn instruments_work_without_a_provider() {
    use opentelemetry::KeyValue;

    metrics::tasks_inserted().add(1, &[KeyValue::new("task_type", "fetch")]);
    metrics::task_duration_ms().record(12.5, &[KeyValue::new("outcome", "completed")]);
}
