//! Configuration for task supervision, circuit breaking and health monitoring.
//!
//! [`GuardConfig`] is an immutable value shared as `Arc<GuardConfig>`. To change
//! it, build a new value (struct update syntax or [`GuardConfig::with_env_overrides`])
//! and construct new components from it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskguard_breaker::BreakerConfig;

use crate::error::{Result, TaskError};

/// Prefix for environment variable overrides (`TASKGUARD_TASK_TIMEOUT_SECS`, ...).
pub const ENV_PREFIX: &str = "TASKGUARD_";

/// Top-level configuration for the supervision layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Default deadline for `run_with_timeout`, in seconds.
    pub task_timeout_secs: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay between retry attempts, in seconds.
    pub retry_delay_secs: f64,
    /// Cap on a single backoff sleep, in seconds.
    pub max_retry_delay_secs: f64,
    /// Fraction (0..=1) of random extra delay added to each backoff.
    pub retry_jitter: f64,

    /// Guard retry calls with the circuit breaker.
    pub enable_circuit_breaker: bool,
    /// Consecutive failures that open a breaker key.
    pub circuit_breaker_threshold: u32,
    /// Per-call run bound used for breaker accounting, in seconds.
    pub circuit_breaker_timeout_secs: f64,
    /// How long a key stays open before one trial call, in seconds.
    pub circuit_breaker_recovery_time_secs: f64,

    /// Start sampling automatically when the facade is built.
    pub enable_performance_monitoring: bool,
    /// Sampling cadence, in seconds.
    pub metrics_interval_secs: f64,
    /// Sample memory and CPU. When false those figures are unknown.
    pub enable_memory_monitoring: bool,
    /// Memory usage percent above which health degrades to warning.
    pub memory_warning_threshold: f64,
    /// CPU usage percent above which health degrades to warning.
    pub cpu_warning_threshold: f64,
    /// Scheduler latency in milliseconds above which health degrades to warning.
    pub latency_warning_ms: f64,
    /// Failure rate above which health degrades to warning.
    pub error_rate_warning: f64,
    /// Failure rate above which health is critical.
    pub error_rate_critical: f64,
    /// A task running longer than this (seconds) degrades health to warning.
    pub max_task_execution_time_secs: f64,

    /// Supervised tasks allowed in flight at once.
    pub max_concurrent_tasks: usize,
    /// Completed task metrics kept in history.
    pub task_history_limit: usize,
    /// Performance snapshots kept in the ring.
    pub snapshot_capacity: usize,
    /// Completed tasks considered for failure rate and average duration.
    pub health_window: usize,

    /// Default tracing filter directive for binaries.
    pub log_level: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 30.0,
            max_retries: 3,
            retry_delay_secs: 0.1,
            max_retry_delay_secs: 30.0,
            retry_jitter: 0.0,
            enable_circuit_breaker: false,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60.0,
            circuit_breaker_recovery_time_secs: 300.0,
            enable_performance_monitoring: false,
            metrics_interval_secs: 5.0,
            enable_memory_monitoring: true,
            memory_warning_threshold: 80.0,
            cpu_warning_threshold: 90.0,
            latency_warning_ms: 100.0,
            error_rate_warning: 0.1,
            error_rate_critical: 0.5,
            max_task_execution_time_secs: 300.0,
            max_concurrent_tasks: 100,
            task_history_limit: 1000,
            snapshot_capacity: 1000,
            health_window: 100,
            log_level: "info".to_owned(),
        }
    }
}

/// Parses a raw environment value into a config field.
trait EnvValue: Sized {
    fn parse_env(raw: &str) -> Option<Self>;
}

impl EnvValue for f64 {
    fn parse_env(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl EnvValue for u32 {
    fn parse_env(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl EnvValue for usize {
    fn parse_env(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl EnvValue for bool {
    fn parse_env(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl EnvValue for String {
    fn parse_env(raw: &str) -> Option<Self> {
        Some(raw.to_owned())
    }
}

fn apply_override<T: EnvValue>(
    lookup: &impl Fn(&str) -> Option<String>,
    field: &str,
    slot: &mut T,
) -> Result<()> {
    let var = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
    let Some(raw) = lookup(&var) else {
        return Ok(());
    };
    *slot = T::parse_env(&raw)
        .ok_or_else(|| TaskError::Config(format!("{var}: cannot parse value {raw:?}")))?;
    Ok(())
}

macro_rules! apply_overrides {
    ($config:ident, $lookup:ident, [$($field:ident),+ $(,)?]) => {
        $( apply_override(&$lookup, stringify!($field), &mut $config.$field)?; )+
    };
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl GuardConfig {
    /// Check every field for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let floats = [
            ("task_timeout_secs", self.task_timeout_secs),
            ("retry_delay_secs", self.retry_delay_secs),
            ("max_retry_delay_secs", self.max_retry_delay_secs),
            ("retry_jitter", self.retry_jitter),
            ("circuit_breaker_timeout_secs", self.circuit_breaker_timeout_secs),
            (
                "circuit_breaker_recovery_time_secs",
                self.circuit_breaker_recovery_time_secs,
            ),
            ("metrics_interval_secs", self.metrics_interval_secs),
            ("memory_warning_threshold", self.memory_warning_threshold),
            ("cpu_warning_threshold", self.cpu_warning_threshold),
            ("latency_warning_ms", self.latency_warning_ms),
            ("error_rate_warning", self.error_rate_warning),
            ("error_rate_critical", self.error_rate_critical),
            ("max_task_execution_time_secs", self.max_task_execution_time_secs),
        ];
        if let Some((name, value)) = floats.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TaskError::Config(format!("{name} must be finite, got {value}")));
        }

        let positive = [
            ("task_timeout_secs", self.task_timeout_secs),
            ("circuit_breaker_timeout_secs", self.circuit_breaker_timeout_secs),
            (
                "circuit_breaker_recovery_time_secs",
                self.circuit_breaker_recovery_time_secs,
            ),
            ("metrics_interval_secs", self.metrics_interval_secs),
            ("max_task_execution_time_secs", self.max_task_execution_time_secs),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| *v <= 0.0) {
            return Err(TaskError::Config(format!("{name} must be positive, got {value}")));
        }

        if self.retry_delay_secs < 0.0 {
            return Err(TaskError::Config(format!(
                "retry_delay_secs must not be negative, got {}",
                self.retry_delay_secs
            )));
        }
        if self.max_retry_delay_secs < self.retry_delay_secs {
            return Err(TaskError::Config(format!(
                "max_retry_delay_secs ({}) must be at least retry_delay_secs ({})",
                self.max_retry_delay_secs, self.retry_delay_secs
            )));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(TaskError::Config(
                "circuit_breaker_threshold must be at least 1".into(),
            ));
        }
        if self.latency_warning_ms < 0.0 {
            return Err(TaskError::Config(format!(
                "latency_warning_ms must not be negative, got {}",
                self.latency_warning_ms
            )));
        }

        let percents = [
            ("memory_warning_threshold", self.memory_warning_threshold),
            ("cpu_warning_threshold", self.cpu_warning_threshold),
        ];
        if let Some((name, value)) = percents
            .iter()
            .find(|(_, v)| !(0.0..=100.0).contains(v))
        {
            return Err(TaskError::Config(format!(
                "{name} must be a percentage in 0..=100, got {value}"
            )));
        }

        let rates = [
            ("retry_jitter", self.retry_jitter),
            ("error_rate_warning", self.error_rate_warning),
            ("error_rate_critical", self.error_rate_critical),
        ];
        if let Some((name, value)) = rates.iter().find(|(_, v)| !(0.0..=1.0).contains(v)) {
            return Err(TaskError::Config(format!(
                "{name} must be in 0..=1, got {value}"
            )));
        }
        if self.error_rate_warning > self.error_rate_critical {
            return Err(TaskError::Config(format!(
                "error_rate_warning ({}) must not exceed error_rate_critical ({})",
                self.error_rate_warning, self.error_rate_critical
            )));
        }

        let limits = [
            ("max_concurrent_tasks", self.max_concurrent_tasks),
            ("task_history_limit", self.task_history_limit),
            ("snapshot_capacity", self.snapshot_capacity),
            ("health_window", self.health_window),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v == 0) {
            return Err(TaskError::Config(format!("{name} must be at least 1")));
        }

        Ok(())
    }

    /// Load configuration from a TOML file. Missing fields fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| TaskError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| TaskError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/taskguard/config.toml`.
    ///
    /// The directory can be overridden with `TASKGUARD_CONFIG_DIR`.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        let dir = std::env::var_os("TASKGUARD_CONFIG_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("taskguard")))
            .unwrap_or_else(|| PathBuf::from("/tmp/taskguard-config"));
        dir.join("config.toml")
    }

    /// Defaults overridden by `TASKGUARD_*` process environment variables, validated.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] if a variable does not parse or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] if a variable does not parse or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self::default().with_env_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// A copy of `self` with every `TASKGUARD_*` variable found by `lookup` applied.
    ///
    /// Variables that name no field are ignored. The result is not validated.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] naming the variable whose value does not parse.
    pub fn with_env_overrides(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = self.clone();
        apply_overrides!(
            config,
            lookup,
            [
                task_timeout_secs,
                max_retries,
                retry_delay_secs,
                max_retry_delay_secs,
                retry_jitter,
                enable_circuit_breaker,
                circuit_breaker_threshold,
                circuit_breaker_timeout_secs,
                circuit_breaker_recovery_time_secs,
                enable_performance_monitoring,
                metrics_interval_secs,
                enable_memory_monitoring,
                memory_warning_threshold,
                cpu_warning_threshold,
                latency_warning_ms,
                error_rate_warning,
                error_rate_critical,
                max_task_execution_time_secs,
                max_concurrent_tasks,
                task_history_limit,
                snapshot_capacity,
                health_window,
                log_level,
            ]
        );
        Ok(config)
    }

    pub fn task_timeout(&self) -> Duration {
        secs(self.task_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        secs(self.max_retry_delay_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        secs(self.metrics_interval_secs)
    }

    pub fn max_task_execution_time(&self) -> Duration {
        secs(self.max_task_execution_time_secs)
    }

    /// Breaker settings derived from the `circuit_breaker_*` fields.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            recovery_time: secs(self.circuit_breaker_recovery_time_secs),
            call_timeout: Some(secs(self.circuit_breaker_timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_delay(), Duration::from_millis(100));
        assert_eq!(config.metrics_interval(), Duration::from_secs(5));
        assert_eq!(config.max_task_execution_time(), Duration::from_secs(300));
    }

    #[test]
    fn breaker_config_maps_fields() {
        let config = GuardConfig {
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout_secs: 2.5,
            circuit_breaker_recovery_time_secs: 10.0,
            ..Default::default()
        };
        let breaker = config.breaker_config();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.recovery_time, Duration::from_secs(10));
        assert_eq!(breaker.call_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn validate_rejects_non_positive_timeout() {
        let config = GuardConfig {
            task_timeout_secs: 0.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("task_timeout_secs"));
    }

    #[test]
    fn validate_rejects_negative_retry_delay() {
        let config = GuardConfig {
            retry_delay_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_cap_below_base_delay() {
        let config = GuardConfig {
            retry_delay_secs: 5.0,
            max_retry_delay_secs: 1.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_retry_delay_secs"));
    }

    #[test]
    fn validate_rejects_zero_threshold() {
        let config = GuardConfig {
            circuit_breaker_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_percent_out_of_range() {
        let config = GuardConfig {
            memory_warning_threshold: 120.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("memory_warning_threshold"));
    }

    #[test]
    fn validate_rejects_inverted_error_rates() {
        let config = GuardConfig {
            error_rate_warning: 0.6,
            error_rate_critical: 0.4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let config = GuardConfig {
            snapshot_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("snapshot_capacity"));
    }

    #[test]
    fn validate_rejects_nan() {
        let config = GuardConfig {
            retry_jitter: f64::NAN,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("finite"));
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        let config = GuardConfig::from_lookup(lookup_from(&[
            ("TASKGUARD_TASK_TIMEOUT_SECS", "12.5"),
            ("TASKGUARD_MAX_RETRIES", "7"),
            ("TASKGUARD_ENABLE_CIRCUIT_BREAKER", "yes"),
            ("TASKGUARD_LOG_LEVEL", "debug"),
            ("TASKGUARD_NOT_A_FIELD", "whatever"),
        ]))
        .unwrap();
        assert_eq!(config.task_timeout(), Duration::from_millis(12_500));
        assert_eq!(config.max_retries, 7);
        assert!(config.enable_circuit_breaker);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_concurrent_tasks, 100);
    }

    #[test]
    fn env_override_parse_failure_names_variable() {
        let err = GuardConfig::from_lookup(lookup_from(&[("TASKGUARD_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, TaskError::Config(_)));
        assert!(err.to_string().contains("TASKGUARD_MAX_RETRIES"));
    }

    #[test]
    fn env_override_result_is_validated() {
        let result =
            GuardConfig::from_lookup(lookup_from(&[("TASKGUARD_HEALTH_WINDOW", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn with_env_overrides_leaves_original_untouched() {
        let base = GuardConfig::default();
        let updated = base
            .with_env_overrides(lookup_from(&[("TASKGUARD_RETRY_JITTER", "0.25")]))
            .unwrap();
        assert!((updated.retry_jitter - 0.25).abs() < f64::EPSILON);
        assert!(base.retry_jitter.abs() < f64::EPSILON);
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = GuardConfig {
            max_retries: 9,
            enable_performance_monitoring: true,
            cpu_warning_threshold: 75.0,
            log_level: "taskguard=trace".into(),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = GuardConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_retries = 1\nenable_circuit_breaker = true\n").unwrap();
        let loaded = GuardConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_retries, 1);
        assert!(loaded.enable_circuit_breaker);
        assert_eq!(loaded.snapshot_capacity, 1000);
    }

    #[test]
    fn from_file_nonexistent_returns_io_error() {
        let result = GuardConfig::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(TaskError::Io(_))));
    }

    #[test]
    fn from_file_invalid_toml_returns_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(GuardConfig::from_file(&path), Err(TaskError::Config(_))));
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = GuardConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("taskguard"));
    }
}
