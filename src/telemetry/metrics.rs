//! Metric instrument factories for genq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"genq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for genq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("genq")
}

/// Counter: tasks created.
/// Labels: `name`.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.created")
        .with_description("Number of tasks created")
        .build()
}

/// Counter: worker pull requests.
/// Labels: `result` ("claimed" | "empty").
pub fn task_pulls() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.pulls")
        .with_description("Number of pull requests served")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: progress reports refused because the reporter lost the task.
pub fn rejected_reports() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.rejected_reports")
        .with_description("Progress reports from workers that no longer hold the task")
        .build()
}

/// Counter: webhook deliveries.
/// Labels: `result` ("ok" | "error").
pub fn webhook_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("genq.webhook.deliveries")
        .with_description("Number of webhook delivery attempts")
        .build()
}

/// Histogram: worker-reported execution time of finished tasks.
/// Labels: `name`.
pub fn task_execution_time_s() -> Histogram<f64> {
    meter()
        .f64_histogram("genq.task.execution_time_s")
        .with_description("Execution time of finished tasks")
        .with_unit("s")
        .build()
}
