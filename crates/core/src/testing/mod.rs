//! Testing utilities for supervisor and dispatcher tests.
//!
//! Provides a reporter that records every snapshot and a set of shell-script
//! workers that speak the stdout protocol, so runs can be exercised without a
//! real worker program.
//!
//! # Example
//!
//! ```rust,ignore
//! use fanout_core::testing::{sh_worker, RecordingReporter, HAPPY_SCRIPT};
//!
//! let supervisor = ProcessSupervisor::new(config, sh_worker(HAPPY_SCRIPT));
//! let reporter = RecordingReporter::new();
//! let report = supervisor.run(Box::new(reporter.clone())).await?;
//! ```

mod recording_reporter;
mod scripts;

pub use recording_reporter::{RecordingReporter, ReporterCall};
pub use scripts::*;
