use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Environment variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "FANOUT_CONFIG";

/// Configuration file used when `FANOUT_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "fanout.toml";

/// Prefix of environment overrides, e.g. `FANOUT_TASK__MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "FANOUT_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_layered(path, Env::prefixed(ENV_PREFIX))
}

fn load_layered(path: &Path, env: Env) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    // Nested keys use a double underscore so single underscores stay in field names.
    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(env.ignore(&["CONFIG"]).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReporterKind;
    use crate::executor::Setting;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[dispatch]
dataset_size = 1000
program = "python3"
args = ["render.py", "--start", "{start}", "--end", "{end}"]

[task]
max_retries = 2

[reporter]
kind = "log"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.dispatch.dataset_size, Some(1000));
        assert_eq!(config.dispatch.args.len(), 5);
        assert_eq!(config.task.max_retries, Setting::Explicit(2));
        assert_eq!(config.reporter.kind, ReporterKind::Log);
    }

    #[test]
    fn test_load_config_from_str_missing_dispatch() {
        let toml = r#"
[task]
max_retries = 2
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/fanout.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[dispatch]
limit = 50
program = "./worker.sh"

[task]
refresh_hz = "default"
log_dir = "run-logs"
"#
        )
        .unwrap();

        let config = load_layered(temp_file.path(), Env::prefixed("FANOUT_LOADER_UNSET_")).unwrap();
        assert_eq!(config.dispatch.limit, Some(50));
        assert_eq!(config.dispatch.program, "./worker.sh");
        assert_eq!(config.task.refresh_hz, Setting::Default);
        assert_eq!(config.task.log_dir.explicit().unwrap().to_str(), Some("run-logs"));
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[dispatch]
dataset_size = 10
program = "worker"

[task]
max_retries = 1
"#
        )
        .unwrap();

        std::env::set_var("FANOUT_LOADER_TEST_TASK__MAX_RETRIES", "7");
        std::env::set_var("FANOUT_LOADER_TEST_DISPATCH__MIN_WORKERS", "2");
        let config =
            load_layered(temp_file.path(), Env::prefixed("FANOUT_LOADER_TEST_")).unwrap();
        std::env::remove_var("FANOUT_LOADER_TEST_TASK__MAX_RETRIES");
        std::env::remove_var("FANOUT_LOADER_TEST_DISPATCH__MIN_WORKERS");

        assert_eq!(config.task.max_retries, Setting::Explicit(7));
        assert_eq!(config.dispatch.min_workers, 2);
    }
}
