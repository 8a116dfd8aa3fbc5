//! Task execution span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{TaskId, TaskState};
use crate::telemetry::metrics;

/// Start a span covering one task from claim to final report.
///
/// The `task.state` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_task_span(name: &str, task_id: TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.id" = %task_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: TaskState, to: TaskState) {
    span.record("task.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}

/// Count a state transition applied to the store. No-op when nothing changed.
pub fn count_transition(from: TaskState, to: TaskState) {
    if from == to {
        return;
    }
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
