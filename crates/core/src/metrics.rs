//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Worker attempts, retries and final outcomes
//! - Items completed across runs
//! - Worker output routed to logs

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Runs
// =============================================================================

/// Completed runs by result.
pub static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fanout_runs_total", "Total supervised runs"),
        &["result"], // "success", "partial_failure", "cancelled", "error"
    )
    .unwrap()
});

/// Items completed by successful partitions.
pub static ITEMS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "fanout_items_completed_total",
        "Items completed by successful partitions",
    )
    .unwrap()
});

// =============================================================================
// Workers
// =============================================================================

/// Worker processes currently running.
pub static WORKERS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("fanout_workers_running", "Worker processes currently running").unwrap()
});

/// Attempts by outcome.
pub static WORKER_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fanout_worker_attempts_total", "Total worker attempts"),
        &["outcome"], // "success" or an attempt failure kind
    )
    .unwrap()
});

/// Relaunches after a failed attempt.
pub static WORKER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("fanout_worker_retries_total", "Total worker relaunches").unwrap()
});

/// Partitions by final status.
pub static WORKERS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fanout_workers_finished_total",
            "Partitions by final status",
        ),
        &["status"], // "success", "failed", "pending"
    )
    .unwrap()
});

/// Attempt duration in seconds.
pub static ATTEMPT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "fanout_attempt_duration_seconds",
            "Duration of a single worker attempt",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
        ]),
        &["outcome"],
    )
    .unwrap()
});

// =============================================================================
// Output
// =============================================================================

/// Lines written to worker logs by source stream.
pub static LOG_LINES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fanout_log_lines_total", "Worker output lines written to logs"),
        &["stream"], // "stdout", "stderr"
    )
    .unwrap()
});

/// Protocol lines applied to worker state.
pub static CONTROL_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fanout_control_events_total",
            "Protocol lines received from workers",
        ),
        &["kind"], // "status", "progress", "message"
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Runs
        Box::new(RUNS_TOTAL.clone()),
        Box::new(ITEMS_COMPLETED.clone()),
        // Workers
        Box::new(WORKERS_RUNNING.clone()),
        Box::new(WORKER_ATTEMPTS.clone()),
        Box::new(WORKER_RETRIES.clone()),
        Box::new(WORKERS_FINISHED.clone()),
        Box::new(ATTEMPT_DURATION.clone()),
        // Output
        Box::new(LOG_LINES.clone()),
        Box::new(CONTROL_EVENTS.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn test_all_metrics_register() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
    }

    #[test]
    fn test_labels_accepted() {
        WORKER_ATTEMPTS.with_label_values(&["success"]).inc();
        WORKERS_FINISHED.with_label_values(&["failed"]).inc();
        LOG_LINES.with_label_values(&["stderr"]).inc();
        ATTEMPT_DURATION
            .with_label_values(&["timeout"])
            .observe(1.5);
        assert!(WORKER_ATTEMPTS.with_label_values(&["success"]).get() >= 1);
    }
}
