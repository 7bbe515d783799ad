use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::executor::Setting;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub task: TaskSettings,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// What to run and how many workers to run it on
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Number of items in the dataset, if known.
    #[serde(default)]
    pub dataset_size: Option<u64>,
    /// Upper bound on the items processed.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Share of host parallelism to use, in percent.
    #[serde(default = "default_worker_load_percent")]
    pub worker_load_percent: f64,
    /// Lower bound for the computed worker count.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound for the computed worker count.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Fixed worker count, bypassing the load formula.
    #[serde(default)]
    pub num_workers: Option<usize>,
    /// Worker executable.
    pub program: String,
    /// Arguments; `{start}`, `{end}`, `{worker_id}` and `{total}` are expanded
    /// per partition.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl DispatchConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            dataset_size: None,
            limit: None,
            worker_load_percent: default_worker_load_percent(),
            min_workers: default_min_workers(),
            max_workers: None,
            num_workers: None,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dataset_size(mut self, dataset_size: u64) -> Self {
        self.dataset_size = Some(dataset_size);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }
}

fn default_worker_load_percent() -> f64 {
    100.0
}

fn default_min_workers() -> usize {
    4
}

/// File-level task settings. Anything left out stays unspecified and falls
/// back to the executor defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub max_retries: Setting<u32>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub refresh_hz: Setting<f64>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub grid_cols: Setting<usize>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub attempt_timeout_secs: Setting<u64>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub log_dir: Setting<PathBuf>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub truncate_logs: Setting<bool>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub retry: Setting<RetrySettings>,
}

/// Backoff between attempts of the same partition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Reporter selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReporterKind {
    None,
    Log,
    #[default]
    Dashboard,
}

/// Reporter configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReporterConfig {
    #[serde(default)]
    pub kind: ReporterKind,
    /// Title shown by the reporter; derived from the worker count when unset.
    #[serde(default)]
    pub title: Option<String>,
}

/// Where to write run artifacts
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// JSON run report.
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    /// Prometheus text dump.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_defaults() {
        let dispatch = DispatchConfig::new("python3");
        assert_eq!(dispatch.worker_load_percent, 100.0);
        assert_eq!(dispatch.min_workers, 4);
        assert!(dispatch.args.is_empty());
    }

    #[test]
    fn test_reporter_kind_parsing() {
        let config: ReporterConfig = toml::from_str(r#"kind = "log""#).unwrap();
        assert_eq!(config.kind, ReporterKind::Log);

        let config: ReporterConfig = toml::from_str("").unwrap();
        assert_eq!(config.kind, ReporterKind::Dashboard);

        assert!(toml::from_str::<ReporterConfig>(r#"kind = "fancy""#).is_err());
    }

    #[test]
    fn test_task_settings_keywords() {
        let settings: TaskSettings = toml::from_str(
            r#"
max_retries = 2
refresh_hz = "default"
"#,
        )
        .unwrap();
        assert_eq!(settings.max_retries, Setting::Explicit(2));
        assert_eq!(settings.refresh_hz, Setting::Default);
        assert_eq!(settings.grid_cols, Setting::Unspecified);
        assert_eq!(settings.retry, Setting::Unspecified);
    }

    #[test]
    fn test_retry_settings_partial_table() {
        let settings: TaskSettings = toml::from_str(
            r#"
[retry]
initial_delay_ms = 250
"#,
        )
        .unwrap();
        let retry = settings.retry.explicit().unwrap();
        assert_eq!(retry.initial_delay_ms, 250);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(retry.max_delay_ms, 30_000);
    }
}
