//! Worker lifecycle state, the shared state table and its snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::TransitionError;
use super::partition::{partition, Partition};
use super::protocol::{ControlEvent, ReportedStatus};

/// Lifecycle status of one partition.
///
/// ```text
/// PENDING -> RUNNING -> SUCCESS
///                    -> FAILED -> RUNNING   (while retries remain)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable record of one partition's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: usize,
    pub status: WorkerStatus,
    /// Size of the partition.
    pub total: u64,
    /// Progress of the current attempt, `0..=total`.
    pub completed: u64,
    /// Latest `MESSAGE:` text of the current attempt.
    pub message: Option<String>,
    pub retries_used: u32,
    pub max_retries: u32,
    pub partition: Partition,
    /// Number of launches so far.
    pub attempts: u32,
    /// Reason the latest attempt failed.
    pub last_error: Option<String>,
    /// Exit code of the latest finished attempt.
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkerState {
    pub fn new(worker_id: usize, partition: Partition, max_retries: u32) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Pending,
            total: partition.len(),
            completed: 0,
            message: None,
            retries_used: 0,
            max_retries,
            partition,
            attempts: 0,
            last_error: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether no further change can happen.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            WorkerStatus::Success => true,
            WorkerStatus::Failed => self.finished_at.is_some(),
            WorkerStatus::Pending | WorkerStatus::Running => false,
        }
    }

    /// Whether a failed partition may be relaunched.
    pub fn can_retry(&self) -> bool {
        self.status == WorkerStatus::Failed
            && self.finished_at.is_none()
            && self.retries_used < self.max_retries
    }

    /// Progress of the current attempt in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            if self.status == WorkerStatus::Success {
                1.0
            } else {
                0.0
            }
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    fn transition(&mut self, to: WorkerStatus) -> Result<(), TransitionError> {
        let allowed = match (self.status, to) {
            (WorkerStatus::Pending, WorkerStatus::Running) => true,
            (WorkerStatus::Running, WorkerStatus::Success) => true,
            (WorkerStatus::Running, WorkerStatus::Failed) => true,
            (WorkerStatus::Failed, WorkerStatus::Running) => self.can_retry(),
            _ => false,
        };

        if !allowed {
            return Err(TransitionError {
                worker_id: self.worker_id,
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }

    /// Moves to `RUNNING` for a fresh launch, consuming a retry when relaunching.
    pub fn begin_attempt(&mut self) -> Result<(), TransitionError> {
        let relaunch = self.status == WorkerStatus::Failed;
        self.transition(WorkerStatus::Running)?;

        if relaunch {
            self.retries_used += 1;
        }
        self.attempts += 1;
        self.completed = 0;
        self.message = None;
        self.exit_code = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Applies a control event from the worker's stdout.
    pub fn apply(&mut self, event: &ControlEvent) -> Result<(), TransitionError> {
        match event {
            ControlEvent::Status(ReportedStatus::Running) => {
                if self.status == WorkerStatus::Running {
                    Ok(())
                } else {
                    Err(TransitionError {
                        worker_id: self.worker_id,
                        from: self.status,
                        to: WorkerStatus::Running,
                    })
                }
            }
            ControlEvent::Status(ReportedStatus::Success) => self.succeed(),
            ControlEvent::Status(ReportedStatus::Failed) => {
                self.fail_attempt("worker reported failure")
            }
            ControlEvent::Progress(completed) => {
                if self.status == WorkerStatus::Running {
                    self.completed = (*completed).min(self.total);
                }
                Ok(())
            }
            ControlEvent::Message(text) => {
                if !self.is_terminal() {
                    self.message = Some(text.clone());
                }
                Ok(())
            }
        }
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkerStatus::Success)?;
        self.last_error = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the current attempt failed. Repeated calls only update the reason.
    pub fn fail_attempt(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != WorkerStatus::Failed || self.is_terminal() {
            self.transition(WorkerStatus::Failed)?;
        }
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Makes a `FAILED` status terminal.
    pub fn finalize_failure(&mut self) {
        if self.status == WorkerStatus::Failed && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Completes an empty partition without launching anything.
    pub fn finish_empty(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkerStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.succeed()
    }
}

/// Builds the initial `PENDING` states for a run.
pub fn initial_states(total_items: u64, num_workers: usize, max_retries: u32) -> Vec<WorkerState> {
    partition(total_items, num_workers)
        .into_iter()
        .enumerate()
        .map(|(worker_id, part)| WorkerState::new(worker_id, part, max_retries))
        .collect()
}

/// Consistent copy of all worker states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub workers: Vec<WorkerState>,
    pub global_completed: u64,
    pub total_items: u64,
}

impl Snapshot {
    pub fn from_states(workers: Vec<WorkerState>) -> Self {
        let global_completed = workers.iter().map(|w| w.completed).sum();
        let total_items = workers.iter().map(|w| w.total).sum();
        Self {
            workers,
            global_completed,
            total_items,
        }
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    /// Whether every worker reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(WorkerState::is_terminal)
    }

    pub fn fraction(&self) -> f64 {
        if self.total_items == 0 {
            if self.is_finished() {
                1.0
            } else {
                0.0
            }
        } else {
            self.global_completed as f64 / self.total_items as f64
        }
    }

    /// One-line status summary.
    pub fn summary(&self) -> String {
        format!(
            "{} pending, {} running, {} succeeded, {} failed",
            self.count(WorkerStatus::Pending),
            self.count(WorkerStatus::Running),
            self.count(WorkerStatus::Success),
            self.count(WorkerStatus::Failed),
        )
    }
}

/// Shared table of worker states.
///
/// Each worker task writes only its own entry; snapshots are taken under a
/// single read lock so aggregates never mix two points in time.
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    inner: Arc<RwLock<Vec<WorkerState>>>,
}

impl StateTable {
    pub fn new(states: Vec<WorkerState>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(states)),
        }
    }

    /// Replaces every state, used at run start.
    pub async fn reset(&self, states: Vec<WorkerState>) {
        *self.inner.write().await = states;
    }

    /// Runs `f` on one worker's state. Returns `None` for unknown ids.
    pub async fn update<R>(
        &self,
        worker_id: usize,
        f: impl FnOnce(&mut WorkerState) -> R,
    ) -> Option<R> {
        let mut states = self.inner.write().await;
        states.get_mut(worker_id).map(f)
    }

    pub async fn get(&self, worker_id: usize) -> Option<WorkerState> {
        self.inner.read().await.get(worker_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Snapshot {
        Snapshot::from_states(self.inner.read().await.clone())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Final states ordered by worker id.
    pub workers: Vec<WorkerState>,
    pub global_completed: u64,
    pub total_items: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.workers.iter().all(|w| w.status == WorkerStatus::Success)
    }

    pub fn failed_workers(&self) -> Vec<&WorkerState> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Failed)
            .collect()
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(total: u64, max_retries: u32) -> WorkerState {
        let mut state = WorkerState::new(0, Partition::new(0, total), max_retries);
        state.begin_attempt().unwrap();
        state
    }

    #[test]
    fn test_new_state_is_pending() {
        let state = WorkerState::new(2, Partition::new(10, 15), 1);
        assert_eq!(state.status, WorkerStatus::Pending);
        assert_eq!(state.total, 5);
        assert_eq!(state.completed, 0);
        assert_eq!(state.attempts, 0);
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_success_path() {
        let mut state = running(10, 0);
        assert_eq!(state.attempts, 1);
        state.apply(&ControlEvent::Progress(10)).unwrap();
        state
            .apply(&ControlEvent::Status(ReportedStatus::Success))
            .unwrap();
        assert_eq!(state.status, WorkerStatus::Success);
        assert_eq!(state.completed, 10);
        assert!(state.is_terminal());
        assert!(state.finished_at.is_some());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut state = running(10, 0);
        state.apply(&ControlEvent::Progress(500)).unwrap();
        assert_eq!(state.completed, 10);
    }

    #[test]
    fn test_message_is_replaced() {
        let mut state = running(10, 0);
        state
            .apply(&ControlEvent::Message("first".to_string()))
            .unwrap();
        state
            .apply(&ControlEvent::Message("second".to_string()))
            .unwrap();
        assert_eq!(state.message.as_deref(), Some("second"));
    }

    #[test]
    fn test_retry_resets_attempt_counters() {
        let mut state = running(10, 2);
        state.apply(&ControlEvent::Progress(4)).unwrap();
        state
            .apply(&ControlEvent::Message("halfway".to_string()))
            .unwrap();
        state.fail_attempt("worker exited with code 1").unwrap();
        assert!(state.can_retry());

        state.begin_attempt().unwrap();
        assert_eq!(state.status, WorkerStatus::Running);
        assert_eq!(state.retries_used, 1);
        assert_eq!(state.attempts, 2);
        assert_eq!(state.completed, 0);
        assert_eq!(state.message, None);
    }

    #[test]
    fn test_retries_are_bounded() {
        let mut state = running(10, 1);
        state.fail_attempt("boom").unwrap();
        state.begin_attempt().unwrap();
        state.fail_attempt("boom").unwrap();

        assert!(!state.can_retry());
        let err = state.begin_attempt().unwrap_err();
        assert_eq!(err.from, WorkerStatus::Failed);
        assert_eq!(state.retries_used, 1);
    }

    #[test]
    fn test_terminal_states_never_regress() {
        let mut state = running(10, 3);
        state.succeed().unwrap();
        assert!(state.fail_attempt("late").is_err());
        assert!(state.begin_attempt().is_err());
        assert!(state
            .apply(&ControlEvent::Status(ReportedStatus::Running))
            .is_err());
        assert_eq!(state.status, WorkerStatus::Success);

        let mut failed = running(10, 3);
        failed.fail_attempt("boom").unwrap();
        failed.finalize_failure();
        assert!(failed.is_terminal());
        assert!(failed.begin_attempt().is_err());
        assert!(failed.succeed().is_err());
    }

    #[test]
    fn test_repeated_failure_report_is_idempotent() {
        let mut state = running(10, 0);
        state
            .apply(&ControlEvent::Status(ReportedStatus::Failed))
            .unwrap();
        state.fail_attempt("worker exited with code 1").unwrap();
        assert_eq!(state.status, WorkerStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("worker exited with code 1"));
    }

    #[test]
    fn test_status_running_after_failure_is_rejected() {
        let mut state = running(10, 2);
        state
            .apply(&ControlEvent::Status(ReportedStatus::Failed))
            .unwrap();
        assert!(state
            .apply(&ControlEvent::Status(ReportedStatus::Running))
            .is_err());
        assert_eq!(state.status, WorkerStatus::Failed);
        assert_eq!(state.retries_used, 0);
    }

    #[test]
    fn test_finish_empty() {
        let mut state = WorkerState::new(3, Partition::new(5, 5), 0);
        state.finish_empty().unwrap();
        assert_eq!(state.status, WorkerStatus::Success);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.fraction(), 1.0);
    }

    #[test]
    fn test_initial_states() {
        let states = initial_states(5, 3, 2);
        let ids: Vec<usize> = states.iter().map(|s| s.worker_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(states.iter().map(|s| s.total).sum::<u64>(), 5);
        assert!(states.iter().all(|s| s.max_retries == 2));
    }

    #[test]
    fn test_snapshot_aggregates() {
        let mut states = initial_states(20, 2, 0);
        states[0].begin_attempt().unwrap();
        states[0].apply(&ControlEvent::Progress(7)).unwrap();
        states[1].begin_attempt().unwrap();
        states[1].apply(&ControlEvent::Progress(3)).unwrap();

        let snapshot = Snapshot::from_states(states);
        assert_eq!(snapshot.global_completed, 10);
        assert_eq!(snapshot.total_items, 20);
        assert_eq!(snapshot.count(WorkerStatus::Running), 2);
        assert!(!snapshot.is_finished());
        assert_eq!(snapshot.fraction(), 0.5);
    }

    #[tokio::test]
    async fn test_state_table_update_and_snapshot() {
        let table = StateTable::new(initial_states(10, 2, 0));
        table
            .update(1, |s| s.begin_attempt())
            .await
            .unwrap()
            .unwrap();
        table
            .update(1, |s| s.apply(&ControlEvent::Progress(5)))
            .await
            .unwrap()
            .unwrap();

        assert!(table.update(9, |_| ()).await.is_none());
        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.global_completed, 5);
        assert_eq!(snapshot.workers[1].status, WorkerStatus::Running);
        assert_eq!(table.len().await, 2);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&WorkerStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");

        let state = WorkerState::new(0, Partition::new(0, 4), 1);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["partition"]["end_index"], 4);
    }

    #[test]
    fn test_state_table_reset() {
        let table = StateTable::new(initial_states(10, 2, 0));
        tokio_test::block_on(async {
            table.update(0, |s| s.begin_attempt()).await;
            table.reset(initial_states(10, 3, 1)).await;

            assert_eq!(table.len().await, 3);
            let first = table.get(0).await.unwrap();
            assert_eq!(first.status, WorkerStatus::Pending);
            assert_eq!(first.max_retries, 1);
        });
    }
}
