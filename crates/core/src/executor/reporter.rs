//! Read-only observers of worker progress.

use tracing::{info, warn};

use super::dashboard::DashboardReporter;
use super::state::{Snapshot, WorkerStatus};
use crate::config::{ReporterConfig, ReporterKind};

/// Receives snapshots of all worker states.
///
/// Reporters get owned copies and have no handle on the state table, so they
/// cannot influence scheduling or outcomes.
pub trait Reporter: Send {
    /// Short identifier, e.g. "dashboard".
    fn name(&self) -> &'static str;

    /// Called once before the first worker launches.
    fn start(&mut self, _snapshot: &Snapshot) {}

    /// Called at the configured refresh rate while the run is in progress.
    fn update(&mut self, snapshot: &Snapshot);

    /// Called once with the final states.
    fn finish(&mut self, snapshot: &Snapshot) {
        self.update(snapshot);
    }
}

/// Reporter that ignores every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl NoopReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for NoopReporter {
    fn name(&self) -> &'static str {
        "none"
    }

    fn update(&mut self, _snapshot: &Snapshot) {}

    fn finish(&mut self, _snapshot: &Snapshot) {}
}

/// Reporter that writes a tracing line whenever the status summary changes.
#[derive(Debug, Clone)]
pub struct LogReporter {
    title: String,
    last_summary: Option<String>,
}

impl LogReporter {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            last_summary: None,
        }
    }
}

impl Reporter for LogReporter {
    fn name(&self) -> &'static str {
        "log"
    }

    fn start(&mut self, snapshot: &Snapshot) {
        info!(
            title = %self.title,
            workers = snapshot.workers.len(),
            total_items = snapshot.total_items,
            "Run started"
        );
    }

    fn update(&mut self, snapshot: &Snapshot) {
        let summary = snapshot.summary();
        if self.last_summary.as_deref() == Some(summary.as_str()) {
            return;
        }

        info!(
            title = %self.title,
            completed = snapshot.global_completed,
            total = snapshot.total_items,
            "{}",
            summary
        );
        self.last_summary = Some(summary);
    }

    fn finish(&mut self, snapshot: &Snapshot) {
        for worker in snapshot
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Failed)
        {
            warn!(
                worker_id = worker.worker_id,
                retries_used = worker.retries_used,
                error = worker.last_error.as_deref().unwrap_or("unknown"),
                "Partition {}..{} failed",
                worker.partition.start_index,
                worker.partition.end_index
            );
        }

        info!(
            title = %self.title,
            completed = snapshot.global_completed,
            total = snapshot.total_items,
            "Run finished: {}",
            snapshot.summary()
        );
    }
}

/// Factory function to create a reporter from config
pub fn create_reporter(config: &ReporterConfig, title: &str, grid_cols: usize) -> Box<dyn Reporter> {
    match config.kind {
        ReporterKind::None => Box::new(NoopReporter::new()),
        ReporterKind::Log => Box::new(LogReporter::new(title)),
        ReporterKind::Dashboard => Box::new(DashboardReporter::new(title, grid_cols)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::state::initial_states;

    #[test]
    fn test_create_reporter_kinds() {
        let mut config = ReporterConfig::default();

        config.kind = ReporterKind::None;
        assert_eq!(create_reporter(&config, "run", 2).name(), "none");

        config.kind = ReporterKind::Log;
        assert_eq!(create_reporter(&config, "run", 2).name(), "log");

        config.kind = ReporterKind::Dashboard;
        assert_eq!(create_reporter(&config, "run", 2).name(), "dashboard");
    }

    #[test]
    fn test_log_reporter_tracks_summary_changes() {
        let mut reporter = LogReporter::new("run");
        let mut states = initial_states(10, 2, 0);
        let snapshot = Snapshot::from_states(states.clone());

        reporter.start(&snapshot);
        reporter.update(&snapshot);
        let first = reporter.last_summary.clone();
        assert_eq!(first.as_deref(), Some("2 pending, 0 running, 0 succeeded, 0 failed"));

        states[0].begin_attempt().unwrap();
        reporter.update(&Snapshot::from_states(states));
        assert_ne!(reporter.last_summary, first);
    }

    #[test]
    fn test_noop_reporter_accepts_snapshots() {
        let mut reporter = NoopReporter::new();
        let snapshot = Snapshot::from_states(initial_states(4, 4, 1));
        reporter.start(&snapshot);
        reporter.update(&snapshot);
        reporter.finish(&snapshot);
        assert_eq!(reporter.name(), "none");
    }
}
