//! Error types for the executor module.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::state::WorkerStatus;

/// Faults that abort a whole run.
///
/// Partition failures are not errors; they end up as `FAILED` workers in the
/// run report.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The task configuration failed validation.
    #[error("Invalid task configuration: {0}")]
    InvalidConfig(String),

    /// The log directory could not be created or cleaned.
    #[error("Failed to prepare log directory {path}: {source}")]
    LogDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing a worker log failed.
    #[error("Failed to write log for worker {worker_id}: {source}")]
    LogWrite {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    /// The worker slot pool was closed while a worker waited for it.
    #[error("Worker pool closed")]
    PoolClosed,
}

/// Why a single attempt of a partition did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The process could not be started.
    #[error("failed to launch worker: {0}")]
    Launch(String),

    /// The worker printed `STATUS: FAILED`.
    #[error("worker reported failure")]
    Reported,

    /// The process exited with a non-zero code.
    #[error("worker exited with code {0}")]
    ExitCode(i32),

    /// The process was terminated by a signal.
    #[error("worker terminated by signal")]
    Signal,

    /// Waiting for the process failed.
    #[error("failed to wait for worker: {0}")]
    Wait(String),

    /// The attempt exceeded its time limit and was killed.
    #[error("worker timed out after {0:?}")]
    TimedOut(Duration),

    /// The run was cancelled while the attempt was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl AttemptFailure {
    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch_error",
            Self::Reported => "reported_failure",
            Self::ExitCode(_) => "exit_code",
            Self::Signal => "signal",
            Self::Wait(_) => "wait_error",
            Self::TimedOut(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A worker status change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("worker {worker_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub worker_id: usize,
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            AttemptFailure::ExitCode(3).to_string(),
            "worker exited with code 3"
        );
        assert_eq!(AttemptFailure::Cancelled.to_string(), "cancelled");
        assert_eq!(
            AttemptFailure::TimedOut(Duration::from_secs(2)).to_string(),
            "worker timed out after 2s"
        );
    }

    #[test]
    fn test_transition_error_message() {
        let err = TransitionError {
            worker_id: 3,
            from: WorkerStatus::Success,
            to: WorkerStatus::Running,
        };
        assert_eq!(err.to_string(), "worker 3: invalid transition SUCCESS -> RUNNING");
    }
}
