use super::{types::Config, ConfigError};
use crate::executor::Setting;

/// Validate configuration
/// Currently validates:
/// - Dispatch program is not empty
/// - Worker bounds are consistent
/// - Task settings are in range
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let dispatch = &config.dispatch;

    if dispatch.program.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "dispatch.program cannot be empty".to_string(),
        ));
    }
    if !dispatch.worker_load_percent.is_finite() || dispatch.worker_load_percent <= 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "dispatch.worker_load_percent must be positive, got {}",
            dispatch.worker_load_percent
        )));
    }
    if dispatch.min_workers == 0 {
        return Err(ConfigError::ValidationError(
            "dispatch.min_workers cannot be 0".to_string(),
        ));
    }
    if dispatch.num_workers == Some(0) || dispatch.max_workers == Some(0) {
        return Err(ConfigError::ValidationError(
            "dispatch worker counts cannot be 0".to_string(),
        ));
    }
    if dispatch.dataset_size.is_none() && dispatch.limit.is_none() {
        return Err(ConfigError::ValidationError(
            "either dispatch.dataset_size or dispatch.limit must be set".to_string(),
        ));
    }

    let task = &config.task;
    if let Setting::Explicit(hz) = task.refresh_hz {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "task.refresh_hz must be positive, got {}",
                hz
            )));
        }
    }
    if task.grid_cols == Setting::Explicit(0) {
        return Err(ConfigError::ValidationError(
            "task.grid_cols cannot be 0".to_string(),
        ));
    }
    if task.attempt_timeout_secs == Setting::Explicit(0) {
        return Err(ConfigError::ValidationError(
            "task.attempt_timeout_secs cannot be 0".to_string(),
        ));
    }
    if let Setting::Explicit(retry) = &task.retry {
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "task.retry.backoff_multiplier must be at least 1.0, got {}",
                retry.backoff_multiplier
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchConfig, RetrySettings, TaskSettings};

    fn valid_config() -> Config {
        Config {
            dispatch: DispatchConfig::new("worker").with_dataset_size(100),
            task: TaskSettings::default(),
            reporter: Default::default(),
            output: Default::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_empty_program_fails() {
        let mut config = valid_config();
        config.dispatch.program = "  ".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_unknown_size_fails() {
        let mut config = valid_config();
        config.dispatch.dataset_size = None;
        assert!(validate_config(&config).is_err());

        config.dispatch.limit = Some(10);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_worker_bounds() {
        let mut config = valid_config();
        config.dispatch.min_workers = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.dispatch.num_workers = Some(0);
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.dispatch.worker_load_percent = -5.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_task_settings() {
        let mut config = valid_config();
        config.task.refresh_hz = Setting::Explicit(0.0);
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.task.grid_cols = Setting::Explicit(0);
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.task.attempt_timeout_secs = Setting::Explicit(0);
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.task.retry = Setting::Explicit(RetrySettings {
            backoff_multiplier: 0.5,
            ..Default::default()
        });
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.task.refresh_hz = Setting::Default;
        assert!(validate_config(&config).is_ok());
    }
}
