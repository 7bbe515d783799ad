pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DispatchConfig,
    OutputConfig, ReporterConfig, ReporterKind, RetrySettings, TaskSettings, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_PATH,
};
pub use dispatcher::{
    host_parallelism, resolve_total, worker_count, CommandTemplate, DispatchError, DispatchPlan,
    Dispatcher, PreparedRun,
};
pub use executor::{
    create_reporter, partition, CommandBuilder, DashboardReporter, LaunchOptions, LogReporter,
    NoopReporter, Partition, ProcessSupervisor, Reporter, RunReport, Setting, ShutdownHandle,
    Snapshot, SupervisorError, TaskConfig, WorkerState, WorkerStatus,
};
