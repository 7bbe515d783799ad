//! Process-pool executor.
//!
//! A run splits `[0, total_items)` into one contiguous range per worker and
//! launches an external program for each range. Workers report back through a
//! small stdout protocol (see [`protocol`]); everything else they print goes to
//! `<log_dir>/worker_<id>.log`. Failed ranges are relaunched up to
//! `max_retries` times while a [`Reporter`] observes read-only snapshots.
//!
//! # Example
//!
//! ```no_run
//! use fanout_core::executor::{ProcessSupervisor, TaskConfig, WorkerState};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaskConfig::builder(1000, 4).max_retries(2u32).build()?;
//! let supervisor = ProcessSupervisor::new(config, |state: &WorkerState| {
//!     vec![
//!         "python3".to_string(),
//!         "render.py".to_string(),
//!         state.partition.start_index.to_string(),
//!         state.partition.end_index.to_string(),
//!     ]
//! });
//! let report = supervisor.run_silent().await?;
//! assert_eq!(report.workers.len(), 4);
//! # Ok(())
//! # }
//! ```

mod config;
mod dashboard;
mod error;
mod log;
mod partition;
pub mod protocol;
mod reporter;
mod state;
mod supervisor;

pub use config::*;
pub use dashboard::*;
pub use error::*;
pub use log::*;
pub use partition::*;
pub use protocol::{classify, classify_all, ControlEvent, Line, ReportedStatus, Stream};
pub use reporter::*;
pub use state::*;
pub use supervisor::{CommandBuilder, LaunchOptions, ProcessSupervisor, ShutdownHandle};
