//! Wires configuration, the process supervisor and a reporter into one run.
//!
//! The dispatcher decides how many items to process and on how many workers,
//! renders each partition's command line from a template and hands everything
//! to a [`ProcessSupervisor`].

use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, ConfigError, DispatchConfig};
use crate::executor::{
    create_reporter, CommandBuilder, LaunchOptions, ProcessSupervisor, Reporter, RunReport,
    ShutdownHandle, SupervisorError, TaskConfig, WorkerState,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dataset size could not be determined and no limit was provided")]
    UnknownDatasetSize,

    #[error("Worker command is empty")]
    EmptyCommand,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Number of CPUs the host makes available to this process.
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Worker count for a host: `max(min_workers, round(cpus * load_percent / 100))`,
/// optionally capped by `max_workers`. Never 0.
pub fn worker_count(
    cpus: usize,
    load_percent: f64,
    min_workers: usize,
    max_workers: Option<usize>,
) -> usize {
    let scaled = (cpus as f64 * load_percent / 100.0).round();
    let scaled = if scaled.is_finite() && scaled > 0.0 {
        scaled as usize
    } else {
        0
    };

    let count = scaled.max(min_workers);
    let count = match max_workers {
        Some(max) => count.min(max),
        None => count,
    };
    count.max(1)
}

/// Number of items to process: the dataset size capped by `limit`.
pub fn resolve_total(dataset_size: Option<u64>, limit: Option<u64>) -> Result<u64, DispatchError> {
    match (dataset_size, limit) {
        (Some(size), Some(limit)) => Ok(size.min(limit)),
        (Some(size), None) => Ok(size),
        (None, Some(limit)) => Ok(limit),
        (None, None) => Err(DispatchError::UnknownDatasetSize),
    }
}

/// Command line with per-partition placeholders.
///
/// `{start}` and `{end}` expand to the partition bounds, `{worker_id}` to the
/// worker id and `{total}` to the number of items in the partition.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(DispatchError::EmptyCommand);
        }
        Ok(Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    pub fn from_config(dispatch: &DispatchConfig) -> Result<Self, DispatchError> {
        Self::new(dispatch.program.clone(), dispatch.args.iter().cloned())
    }

    pub fn render(&self, state: &WorkerState) -> Vec<String> {
        let start = state.partition.start_index.to_string();
        let end = state.partition.end_index.to_string();
        let worker_id = state.worker_id.to_string();
        let total = state.total.to_string();

        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|arg| {
                arg.replace("{start}", &start)
                    .replace("{end}", &end)
                    .replace("{worker_id}", &worker_id)
                    .replace("{total}", &total)
            }))
            .collect()
    }
}

impl CommandBuilder for CommandTemplate {
    fn build(&self, state: &WorkerState) -> Vec<String> {
        self.render(state)
    }
}

/// Resolved shape of a run.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub total_items: u64,
    pub num_workers: usize,
    pub title: String,
    pub task: TaskConfig,
}

/// A run ready to start: supervisor plus the reporter chosen by configuration.
pub struct PreparedRun {
    pub plan: DispatchPlan,
    supervisor: ProcessSupervisor,
    reporter: Box<dyn Reporter>,
}

impl PreparedRun {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.supervisor.shutdown_handle()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Replaces the configured reporter.
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub async fn run(self) -> Result<RunReport, DispatchError> {
        Ok(self.supervisor.run(self.reporter).await?)
    }
}

/// Turns a [`Config`] into a supervised run.
pub struct Dispatcher {
    config: Config,
    host_parallelism: usize,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            host_parallelism: host_parallelism(),
        }
    }

    /// Overrides the detected CPU count.
    pub fn with_host_parallelism(mut self, cpus: usize) -> Self {
        self.host_parallelism = cpus;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> Result<DispatchPlan, DispatchError> {
        let dispatch = &self.config.dispatch;
        let total_items = resolve_total(dispatch.dataset_size, dispatch.limit)?;
        let num_workers = dispatch.num_workers.unwrap_or_else(|| {
            worker_count(
                self.host_parallelism,
                dispatch.worker_load_percent,
                dispatch.min_workers,
                dispatch.max_workers,
            )
        });

        let task = TaskConfig::builder(total_items, num_workers)
            .with_settings(&self.config.task)
            .build()?;

        let title = match &self.config.reporter.title {
            Some(title) => format!("{} ({} Workers)", title, num_workers),
            None => format!("Parallel Run ({} Workers)", num_workers),
        };

        Ok(DispatchPlan {
            total_items,
            num_workers,
            title,
            task,
        })
    }

    pub fn prepare(&self) -> Result<PreparedRun, DispatchError> {
        let plan = self.plan()?;
        let dispatch = &self.config.dispatch;
        let template = CommandTemplate::from_config(dispatch)?;

        let mut launch = LaunchOptions::new();
        launch.env = dispatch.env.clone();
        launch.current_dir = dispatch.working_dir.clone();

        info!(
            "Dispatching {} items to {} workers: {}",
            plan.total_items, plan.num_workers, dispatch.program
        );

        let reporter = create_reporter(&self.config.reporter, &plan.title, plan.task.grid_cols);
        let supervisor =
            ProcessSupervisor::new(plan.task.clone(), template).with_launch_options(launch);

        Ok(PreparedRun {
            plan,
            supervisor,
            reporter,
        })
    }

    pub async fn run(&self) -> Result<RunReport, DispatchError> {
        self.prepare()?.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReporterKind, TaskSettings};
    use crate::executor::{Partition, Setting};

    fn config(dispatch: DispatchConfig) -> Config {
        Config {
            dispatch,
            task: TaskSettings::default(),
            reporter: Default::default(),
            output: Default::default(),
        }
    }

    #[test]
    fn test_worker_count_formula() {
        assert_eq!(worker_count(16, 50.0, 4, None), 8);
        assert_eq!(worker_count(4, 50.0, 4, None), 4);
        assert_eq!(worker_count(6, 25.0, 1, None), 2);
        assert_eq!(worker_count(32, 100.0, 4, Some(10)), 10);
        assert_eq!(worker_count(1, 0.0, 0, None), 1);
    }

    #[test]
    fn test_resolve_total() {
        assert_eq!(resolve_total(Some(1000), Some(200)).unwrap(), 200);
        assert_eq!(resolve_total(Some(100), Some(200)).unwrap(), 100);
        assert_eq!(resolve_total(Some(100), None).unwrap(), 100);
        assert_eq!(resolve_total(None, Some(50)).unwrap(), 50);
        assert!(matches!(
            resolve_total(None, None),
            Err(DispatchError::UnknownDatasetSize)
        ));
    }

    #[test]
    fn test_template_rendering() {
        let template = CommandTemplate::new(
            "python3",
            ["render.py", "--start", "{start}", "--end", "{end}", "--shard={worker_id}/{total}"],
        )
        .unwrap();
        let state = WorkerState::new(3, Partition::new(30, 40), 0);

        assert_eq!(
            template.render(&state),
            vec![
                "python3",
                "render.py",
                "--start",
                "30",
                "--end",
                "40",
                "--shard=3/10"
            ]
        );
    }

    #[test]
    fn test_empty_program_rejected() {
        assert!(matches!(
            CommandTemplate::new("", Vec::<String>::new()),
            Err(DispatchError::EmptyCommand)
        ));
    }

    #[test]
    fn test_plan_uses_load_formula() {
        let dispatcher = Dispatcher::new(config(
            DispatchConfig::new("worker").with_dataset_size(1000).with_limit(200),
        ))
        .with_host_parallelism(16);

        let plan = dispatcher.plan().unwrap();
        assert_eq!(plan.total_items, 200);
        assert_eq!(plan.num_workers, 16);
        assert_eq!(plan.task.num_workers, 16);
        assert_eq!(plan.title, "Parallel Run (16 Workers)");
    }

    #[test]
    fn test_plan_applies_task_settings_and_title() {
        let mut cfg = config(DispatchConfig::new("worker").with_limit(10).with_num_workers(2));
        cfg.task.max_retries = Setting::Explicit(5);
        cfg.reporter.title = Some("Parallel Rendering".to_string());
        cfg.reporter.kind = ReporterKind::None;

        let plan = Dispatcher::new(cfg).plan().unwrap();
        assert_eq!(plan.num_workers, 2);
        assert_eq!(plan.task.max_retries, 5);
        assert_eq!(plan.title, "Parallel Rendering (2 Workers)");
    }

    #[test]
    fn test_plan_unknown_size() {
        let dispatcher = Dispatcher::new(config(DispatchConfig::new("worker")));
        assert!(matches!(
            dispatcher.plan(),
            Err(DispatchError::UnknownDatasetSize)
        ));
    }
}
