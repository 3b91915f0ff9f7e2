//! Process-level observability wiring.
//!
//! Structured logs go through `tracing` with `job_id`/`trace_id`/`attempt`
//! fields at the call sites; this module owns subscriber setup and metric
//! descriptions. Exporter choice (Prometheus et al.) belongs to the embedding
//! process.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize human-readable log output. `default_filter` applies when
/// `RUST_LOG` is unset, e.g. `"info,lathe=debug"`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize JSON log output for log shippers.
pub fn init_tracing_json(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "lathe_jobs_submitted_total",
        "Submissions by kind and outcome (created/duplicate)"
    );
    metrics::describe_counter!(
        "lathe_intake_rate_limited_total",
        "Submissions rejected by the owner or global token bucket"
    );
    metrics::describe_counter!(
        "lathe_publish_confirmed_total",
        "Task publishes confirmed by the broker"
    );
    metrics::describe_counter!(
        "lathe_publish_retries_total",
        "Publish attempts that were nacked or timed out"
    );
    metrics::describe_counter!(
        "lathe_publish_failed_total",
        "Jobs moved to failed(PUBLISH_FAILED) after confirm retries"
    );
    metrics::describe_counter!(
        "lathe_job_transitions_total",
        "State machine transitions by target state"
    );
    metrics::describe_counter!("lathe_claims_lost_total", "Claims lost to a concurrent worker");
    metrics::describe_counter!(
        "lathe_claims_skipped_total",
        "Deliveries acked without work because the job was not claimable"
    );
    metrics::describe_counter!("lathe_tasks_succeeded_total", "Tasks finished successfully");
    metrics::describe_counter!("lathe_tasks_retried_total", "Tasks scheduled for retry");
    metrics::describe_counter!("lathe_tasks_cancelled_total", "Tasks cancelled cooperatively");
    metrics::describe_counter!("lathe_tasks_timed_out_total", "Tasks over their wall-clock budget");
    metrics::describe_counter!("lathe_dlq_total", "Messages routed to a dead-letter queue");
    metrics::describe_counter!("lathe_dlq_replayed_total", "DLQ messages replayed to primary");
    metrics::describe_counter!("lathe_cancel_requests_total", "Accepted cancellation requests");
    metrics::describe_counter!(
        "lathe_progress_persisted_total",
        "Progress reports persisted to the job store"
    );
    metrics::describe_counter!(
        "lathe_progress_throttled_total",
        "Progress reports coalesced by the throttle"
    );
    metrics::describe_counter!(
        "lathe_progress_dropped_total",
        "Progress reports dropped (monotonicity)"
    );
    metrics::describe_counter!(
        "lathe_envelope_rejected_total",
        "Deliveries rejected by envelope validation"
    );
    metrics::describe_histogram!("lathe_task_duration_ms", "Task execution wall time");
}
