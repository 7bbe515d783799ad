//! Reporter that records every snapshot it receives.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::executor::{Reporter, Snapshot};

/// Which reporter callback produced a recorded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterCall {
    Start,
    Update,
    Finish,
}

/// Reporter that keeps every snapshot for later assertions.
///
/// Clones share the same recording, so keep one clone and hand the other to
/// the supervisor.
///
/// # Example
///
/// ```rust,ignore
/// use fanout_core::testing::RecordingReporter;
///
/// let reporter = RecordingReporter::new();
/// let report = supervisor.run(Box::new(reporter.clone())).await?;
///
/// assert_eq!(reporter.start_count(), 1);
/// assert!(reporter.last().unwrap().is_finished());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    calls: Arc<Mutex<Vec<(ReporterCall, Snapshot)>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ReporterCall, Snapshot)>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ReporterCall, snapshot: &Snapshot) {
        self.lock().push((call, snapshot.clone()));
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<(ReporterCall, Snapshot)> {
        self.lock().clone()
    }

    pub fn count(&self, call: ReporterCall) -> usize {
        self.lock().iter().filter(|(c, _)| *c == call).count()
    }

    pub fn start_count(&self) -> usize {
        self.count(ReporterCall::Start)
    }

    pub fn update_count(&self) -> usize {
        self.count(ReporterCall::Update)
    }

    pub fn finish_count(&self) -> usize {
        self.count(ReporterCall::Finish)
    }

    /// The most recent snapshot.
    pub fn last(&self) -> Option<Snapshot> {
        self.lock().last().map(|(_, snapshot)| snapshot.clone())
    }
}

impl Reporter for RecordingReporter {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn start(&mut self, snapshot: &Snapshot) {
        self.record(ReporterCall::Start, snapshot);
    }

    fn update(&mut self, snapshot: &Snapshot) {
        self.record(ReporterCall::Update, snapshot);
    }

    fn finish(&mut self, snapshot: &Snapshot) {
        self.record(ReporterCall::Finish, snapshot);
    }
}
