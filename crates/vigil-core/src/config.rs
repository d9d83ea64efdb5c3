//! Runtime configuration read from `VIGIL_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::app::log_hub::{DEFAULT_HISTORY_LIMIT, DEFAULT_LISTENER_CAPACITY};
use crate::app::profiles::{DEFAULT_PROFILE_MAX_COUNT, DEFAULT_PROFILE_MAX_SIZE, ProfilePolicy};
use crate::app::scheduler::{PROBE_TIMEOUT, SchedulerSettings};

pub const ENV_DATA_DIR: &str = "VIGIL_DATA_DIR";
pub const ENV_MAX_WORKERS: &str = "VIGIL_MAX_WORKERS";
pub const ENV_SCAN_TIMEOUT: &str = "VIGIL_SCAN_TIMEOUT";
pub const ENV_RETENTION: &str = "VIGIL_RETENTION";
pub const ENV_RETENTION_INTERVAL: &str = "VIGIL_RETENTION_INTERVAL";
pub const ENV_SWEEP_INTERVAL: &str = "VIGIL_SWEEP_INTERVAL";
pub const ENV_ENGINE: &str = "VIGIL_ENGINE";
pub const ENV_ENGINE_SERVER: &str = "VIGIL_ENGINE_SERVER";
pub const ENV_ENGINE_PROBE: &str = "VIGIL_ENGINE_PROBE";
pub const ENV_LOG_HISTORY: &str = "VIGIL_LOG_HISTORY";
pub const ENV_LISTENER_CAPACITY: &str = "VIGIL_LISTENER_CAPACITY";
pub const ENV_PROFILE_ALLOW_PASSWORD: &str = "VIGIL_PROFILE_ALLOW_PASSWORD";
pub const ENV_PROFILE_MAX_SIZE: &str = "VIGIL_PROFILE_MAX_SIZE";
pub const ENV_PROFILE_MAX_COUNT: &str = "VIGIL_PROFILE_MAX_COUNT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid duration {value:?}: {reason}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: invalid number {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key}: invalid boolean {value:?}")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

/// Immutable settings for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub max_workers: usize,
    pub scan_timeout: Duration,
    /// Zero disables the retention sweep.
    pub retention: Duration,
    pub retention_interval: Duration,
    pub sweep_interval: Duration,
    pub engine: String,
    pub engine_server: Option<String>,
    pub engine_probe: bool,
    pub log_history: usize,
    pub listener_capacity: usize,
    pub profile_allow_password: bool,
    pub profile_max_size: usize,
    pub profile_max_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_workers: 5,
            scan_timeout: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(90 * 24 * 60 * 60),
            retention_interval: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(1),
            engine: "trivy".to_string(),
            engine_server: None,
            engine_probe: true,
            log_history: DEFAULT_HISTORY_LIMIT,
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            profile_allow_password: false,
            profile_max_size: DEFAULT_PROFILE_MAX_SIZE,
            profile_max_count: DEFAULT_PROFILE_MAX_COUNT,
        }
    }
}

fn duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn number(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}

fn boolean(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

impl Config {
    /// Read the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_MAX_WORKERS) {
            config.max_workers = number(ENV_MAX_WORKERS, &v)?;
        }
        if let Some(v) = get(ENV_SCAN_TIMEOUT) {
            config.scan_timeout = duration(ENV_SCAN_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_RETENTION) {
            config.retention = duration(ENV_RETENTION, &v)?;
        }
        if let Some(v) = get(ENV_RETENTION_INTERVAL) {
            config.retention_interval = duration(ENV_RETENTION_INTERVAL, &v)?;
        }
        if let Some(v) = get(ENV_SWEEP_INTERVAL) {
            config.sweep_interval = duration(ENV_SWEEP_INTERVAL, &v)?;
        }
        if let Some(v) = get(ENV_ENGINE) {
            config.engine = v.trim().to_string();
        }
        config.engine_server = get(ENV_ENGINE_SERVER).map(|v| v.trim().to_string());
        if let Some(v) = get(ENV_ENGINE_PROBE) {
            config.engine_probe = boolean(ENV_ENGINE_PROBE, &v)?;
        }
        if let Some(v) = get(ENV_LOG_HISTORY) {
            config.log_history = number(ENV_LOG_HISTORY, &v)?;
        }
        if let Some(v) = get(ENV_LISTENER_CAPACITY) {
            config.listener_capacity = number(ENV_LISTENER_CAPACITY, &v)?;
        }
        if let Some(v) = get(ENV_PROFILE_ALLOW_PASSWORD) {
            config.profile_allow_password = boolean(ENV_PROFILE_ALLOW_PASSWORD, &v)?;
        }
        if let Some(v) = get(ENV_PROFILE_MAX_SIZE) {
            config.profile_max_size = number(ENV_PROFILE_MAX_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_PROFILE_MAX_COUNT) {
            config.profile_max_count = number(ENV_PROFILE_MAX_COUNT, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (ENV_MAX_WORKERS, self.max_workers == 0),
            (ENV_SCAN_TIMEOUT, self.scan_timeout.is_zero()),
            (ENV_RETENTION_INTERVAL, self.retention_interval.is_zero()),
            (ENV_SWEEP_INTERVAL, self.sweep_interval.is_zero()),
            (ENV_LOG_HISTORY, self.log_history == 0),
            (ENV_LISTENER_CAPACITY, self.listener_capacity == 0),
            (ENV_PROFILE_MAX_SIZE, self.profile_max_size == 0),
            (ENV_PROFILE_MAX_COUNT, self.profile_max_count == 0),
        ];
        match positive.into_iter().find(|(_, zero)| *zero) {
            Some((key, _)) => Err(ConfigError::Zero { key }),
            None => Ok(()),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_workers: self.max_workers,
            scan_timeout: self.scan_timeout,
            sweep_interval: self.sweep_interval,
            engine: self.engine.clone(),
            engine_server: self.engine_server.clone(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn profile_policy(&self) -> ProfilePolicy {
        ProfilePolicy {
            allow_password: self.profile_allow_password,
            max_size: self.profile_max_size,
            max_count: self.profile_max_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(load(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("VIGIL_DATA_DIR", "/var/lib/vigil"),
            ("VIGIL_MAX_WORKERS", "2"),
            ("VIGIL_SCAN_TIMEOUT", "5m 30s"),
            ("VIGIL_RETENTION", "0"),
            ("VIGIL_RETENTION_INTERVAL", "1h"),
            ("VIGIL_SWEEP_INTERVAL", "250ms"),
            ("VIGIL_ENGINE", "/usr/local/bin/trivy"),
            ("VIGIL_ENGINE_SERVER", "http://trivy:4954"),
            ("VIGIL_ENGINE_PROBE", "off"),
            ("VIGIL_LOG_HISTORY", "500"),
            ("VIGIL_LISTENER_CAPACITY", "8"),
            ("VIGIL_PROFILE_ALLOW_PASSWORD", "true"),
            ("VIGIL_PROFILE_MAX_SIZE", "8192"),
            ("VIGIL_PROFILE_MAX_COUNT", "10"),
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/vigil"));
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.scan_timeout, Duration::from_secs(330));
        assert!(config.retention.is_zero());
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.engine_server.as_deref(), Some("http://trivy:4954"));
        assert!(!config.engine_probe);
        assert_eq!((config.log_history, config.listener_capacity), (500, 8));

        let settings = config.scheduler_settings();
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.engine, "/usr/local/bin/trivy");

        let policy = config.profile_policy();
        assert!(policy.allow_password);
        assert_eq!((policy.max_size, policy.max_count), (8192, 10));
    }

    #[rstest]
    #[case::zero_workers("VIGIL_MAX_WORKERS", "0")]
    #[case::not_a_number("VIGIL_MAX_WORKERS", "five")]
    #[case::bad_duration("VIGIL_SCAN_TIMEOUT", "soon")]
    #[case::zero_timeout("VIGIL_SCAN_TIMEOUT", "0")]
    #[case::bad_bool("VIGIL_ENGINE_PROBE", "maybe")]
    #[case::zero_profile_count("VIGIL_PROFILE_MAX_COUNT", "0")]
    #[case::bad_password_flag("VIGIL_PROFILE_ALLOW_PASSWORD", "sometimes")]
    fn invalid_values_are_rejected(#[case] key: &str, #[case] value: &str) {
        assert!(load(&[(key, value)]).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("VIGIL_MAX_WORKERS", "  "), ("VIGIL_ENGINE_SERVER", "")]).unwrap();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.engine_server, None);
    }
}
