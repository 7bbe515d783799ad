//! Immutable run parameters for the process supervisor.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, RetrySettings, TaskSettings};

/// Default number of retries per partition.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default reporter refresh rate.
pub const DEFAULT_REFRESH_HZ: f64 = 4.0;

/// Lowest refresh rate a reporter is driven at.
pub const MIN_REFRESH_HZ: f64 = 0.5;

/// Highest refresh rate a reporter is driven at.
pub const MAX_REFRESH_HZ: f64 = 30.0;

/// Upper bound for the default grid width.
pub const DEFAULT_MAX_GRID_COLS: usize = 4;

/// Default directory for per-worker logs.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// A configuration value that may be left open, forced to the built-in
/// default, or given explicitly.
///
/// `Unspecified` defers to an outer layer (see [`Setting::or`]), while
/// `Default` pins the built-in default even when an outer layer has a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting<T> {
    Unspecified,
    Default,
    Explicit(T),
}

impl<T> Setting<T> {
    /// Returns `self` unless it is `Unspecified`, in which case `outer` is used.
    pub fn or(self, outer: Setting<T>) -> Setting<T> {
        match self {
            Setting::Unspecified => outer,
            other => other,
        }
    }

    /// Resolves to the explicit value or the given default.
    pub fn resolve(self, default: T) -> T {
        match self {
            Setting::Explicit(value) => value,
            Setting::Unspecified | Setting::Default => default,
        }
    }

    /// Resolves to the explicit value or a lazily computed default.
    pub fn resolve_with(self, default: impl FnOnce() -> T) -> T {
        match self {
            Setting::Explicit(value) => value,
            Setting::Unspecified | Setting::Default => default(),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, Setting::Unspecified)
    }

    pub fn explicit(&self) -> Option<&T> {
        match self {
            Setting::Explicit(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Setting<U> {
        match self {
            Setting::Unspecified => Setting::Unspecified,
            Setting::Default => Setting::Default,
            Setting::Explicit(value) => Setting::Explicit(f(value)),
        }
    }
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Setting::Unspecified
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Setting::Explicit(value)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum SettingKeyword {
    Default,
    Unspecified,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSetting<T> {
    Keyword(SettingKeyword),
    Value(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawSetting::deserialize(deserializer)? {
            RawSetting::Keyword(SettingKeyword::Default) => Setting::Default,
            RawSetting::Keyword(SettingKeyword::Unspecified) => Setting::Unspecified,
            RawSetting::Value(value) => Setting::Explicit(value),
        })
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Setting::Unspecified => serializer.serialize_str("unspecified"),
            Setting::Default => serializer.serialize_str("default"),
            Setting::Explicit(value) => value.serialize(serializer),
        }
    }
}

/// Delay policy between a failed attempt and the relaunch of its partition.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that relaunches immediately.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Delay before the `retry`-th relaunch (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() || retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32 - 1);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Parameters of one supervised run. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// Size of the global work range `[0, total_items)`.
    pub total_items: u64,
    /// Number of partitions, one process each.
    pub num_workers: usize,
    /// Relaunches allowed per partition after its first failure.
    pub max_retries: u32,
    /// Reporter refresh rate, already clamped.
    pub refresh_hz: f64,
    /// Panels per row in multi-panel reporters.
    pub grid_cols: usize,
    /// Wall-clock limit for a single attempt.
    pub attempt_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub log_dir: PathBuf,
    /// Remove this run's worker logs before the first attempt.
    pub truncate_logs: bool,
}

impl TaskConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(total_items: u64, num_workers: usize, max_retries: u32) -> Self {
        Self {
            total_items,
            num_workers,
            max_retries,
            refresh_hz: DEFAULT_REFRESH_HZ,
            grid_cols: default_grid_cols(num_workers),
            attempt_timeout: None,
            retry: RetryPolicy::immediate(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            truncate_logs: true,
        }
    }

    pub fn builder(total_items: u64, num_workers: usize) -> TaskConfigBuilder {
        TaskConfigBuilder::new(total_items, num_workers)
    }

    /// Interval between two reporter refreshes.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / clamp_refresh_hz(self.refresh_hz))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationError(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if !self.refresh_hz.is_finite() || self.refresh_hz <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "refresh_hz must be a positive number, got {}",
                self.refresh_hz
            )));
        }
        if self.grid_cols == 0 {
            return Err(ConfigError::ValidationError(
                "grid_cols cannot be 0".to_string(),
            ));
        }
        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationError(
                "attempt timeout cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_grid_cols(num_workers: usize) -> usize {
    num_workers.clamp(1, DEFAULT_MAX_GRID_COLS)
}

fn clamp_refresh_hz(hz: f64) -> f64 {
    hz.clamp(MIN_REFRESH_HZ, MAX_REFRESH_HZ)
}

/// Builder resolving [`Setting`] values into a [`TaskConfig`].
#[derive(Debug, Clone)]
pub struct TaskConfigBuilder {
    total_items: u64,
    num_workers: usize,
    max_retries: Setting<u32>,
    refresh_hz: Setting<f64>,
    grid_cols: Setting<usize>,
    attempt_timeout: Setting<Duration>,
    retry: Setting<RetryPolicy>,
    log_dir: Setting<PathBuf>,
    truncate_logs: Setting<bool>,
}

impl TaskConfigBuilder {
    pub fn new(total_items: u64, num_workers: usize) -> Self {
        Self {
            total_items,
            num_workers,
            max_retries: Setting::Unspecified,
            refresh_hz: Setting::Unspecified,
            grid_cols: Setting::Unspecified,
            attempt_timeout: Setting::Unspecified,
            retry: Setting::Unspecified,
            log_dir: Setting::Unspecified,
            truncate_logs: Setting::Unspecified,
        }
    }

    pub fn max_retries(mut self, value: impl Into<Setting<u32>>) -> Self {
        self.max_retries = value.into();
        self
    }

    pub fn refresh_hz(mut self, value: impl Into<Setting<f64>>) -> Self {
        self.refresh_hz = value.into();
        self
    }

    pub fn grid_cols(mut self, value: impl Into<Setting<usize>>) -> Self {
        self.grid_cols = value.into();
        self
    }

    pub fn attempt_timeout(mut self, value: impl Into<Setting<Duration>>) -> Self {
        self.attempt_timeout = value.into();
        self
    }

    pub fn retry(mut self, value: impl Into<Setting<RetryPolicy>>) -> Self {
        self.retry = value.into();
        self
    }

    pub fn log_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.log_dir = Setting::Explicit(value.into());
        self
    }

    pub fn truncate_logs(mut self, value: impl Into<Setting<bool>>) -> Self {
        self.truncate_logs = value.into();
        self
    }

    /// Fills every still-unspecified value from file-level settings.
    pub fn with_settings(mut self, settings: &TaskSettings) -> Self {
        self.max_retries = self.max_retries.or(settings.max_retries);
        self.refresh_hz = self.refresh_hz.or(settings.refresh_hz);
        self.grid_cols = self.grid_cols.or(settings.grid_cols);
        self.attempt_timeout = self
            .attempt_timeout
            .or(settings.attempt_timeout_secs.map(Duration::from_secs));
        self.retry = self
            .retry
            .or(settings.retry.clone().map(|r| RetryPolicy::from(&r)));
        self.log_dir = self.log_dir.or(settings.log_dir.clone());
        self.truncate_logs = self.truncate_logs.or(settings.truncate_logs);
        self
    }

    pub fn build(self) -> Result<TaskConfig, ConfigError> {
        if let Some(hz) = self.refresh_hz.explicit() {
            if !hz.is_finite() || *hz <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "refresh_hz must be a positive number, got {}",
                    hz
                )));
            }
        }
        if self.grid_cols.explicit() == Some(&0) {
            return Err(ConfigError::ValidationError(
                "grid_cols cannot be 0".to_string(),
            ));
        }

        let num_workers = self.num_workers;
        let config = TaskConfig {
            total_items: self.total_items,
            num_workers,
            max_retries: self.max_retries.resolve(DEFAULT_MAX_RETRIES),
            refresh_hz: clamp_refresh_hz(self.refresh_hz.resolve(DEFAULT_REFRESH_HZ)),
            grid_cols: self.grid_cols.resolve_with(|| default_grid_cols(num_workers)),
            attempt_timeout: self.attempt_timeout.explicit().copied(),
            retry: self.retry.resolve_with(RetryPolicy::immediate),
            log_dir: self
                .log_dir
                .resolve_with(|| PathBuf::from(DEFAULT_LOG_DIR)),
            truncate_logs: self.truncate_logs.resolve(true),
        };
        config.validate()?;
        Ok(config)
    }
}
