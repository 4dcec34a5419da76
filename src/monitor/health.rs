//! Health verdicts derived from snapshots, task metrics and breaker state.
//!
//! | Verdict | When |
//! |---------|------|
//! | [`HealthVerdict::Critical`] | a breaker key is open, or the failure rate exceeds `error_rate_critical` |
//! | [`HealthVerdict::Warning`] | memory, CPU or scheduler latency exceeds its threshold, the failure rate exceeds `error_rate_warning`, or a task runs past `max_task_execution_time` |
//! | [`HealthVerdict::Healthy`] | otherwise |
//!
//! Every comparison is strict, so a figure equal to its threshold is healthy.
//! Unknown figures are reported as `None` and never trip a threshold.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::GuardConfig;

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Health report returned by `PerformanceMonitor::get_health_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub verdict: HealthVerdict,
    /// Human-readable reason for every threshold that was crossed.
    pub reasons: Vec<String>,
    pub memory_usage_percent: Option<f64>,
    pub cpu_usage_percent: Option<f64>,
    pub scheduler_latency_ms: Option<f64>,
    pub active_tasks: usize,
    pub avg_task_duration: Option<Duration>,
    pub error_rate: Option<f64>,
    pub open_breakers: Vec<String>,
    pub long_running_tasks: usize,
    pub snapshots_recorded: usize,
    pub uptime: Duration,
    pub monitoring: bool,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.verdict == HealthVerdict::Healthy
    }
}

/// Everything [`evaluate`] looks at, gathered by the monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthInputs {
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub scheduler_latency: Option<Duration>,
    pub active_tasks: usize,
    /// Failure rate over the last `health_window` completed tasks.
    pub error_rate: Option<f64>,
    pub avg_task_duration: Option<Duration>,
    pub open_breakers: Vec<String>,
    pub long_running_tasks: usize,
    pub snapshots_recorded: usize,
    pub uptime: Duration,
    pub monitoring: bool,
}

fn exceeds(value: Option<f64>, threshold: f64) -> Option<f64> {
    value.filter(|v| *v > threshold)
}

/// Classify `inputs` against the thresholds in `config`. Never fails.
pub fn evaluate(inputs: HealthInputs, config: &GuardConfig) -> HealthStatus {
    let mut critical = Vec::new();
    let mut warning = Vec::new();

    if !inputs.open_breakers.is_empty() {
        critical.push(format!(
            "circuit breaker open: {}",
            inputs.open_breakers.join(", ")
        ));
    }

    if let Some(rate) = exceeds(inputs.error_rate, config.error_rate_critical) {
        critical.push(format!(
            "error rate {:.1}% above critical {:.1}%",
            rate * 100.0,
            config.error_rate_critical * 100.0
        ));
    } else if let Some(rate) = exceeds(inputs.error_rate, config.error_rate_warning) {
        warning.push(format!(
            "error rate {:.1}% above {:.1}%",
            rate * 100.0,
            config.error_rate_warning * 100.0
        ));
    }

    if let Some(pct) = exceeds(inputs.memory_percent, config.memory_warning_threshold) {
        warning.push(format!(
            "memory usage {pct:.1}% above {:.1}%",
            config.memory_warning_threshold
        ));
    }

    if let Some(pct) = exceeds(inputs.cpu_percent, config.cpu_warning_threshold) {
        warning.push(format!(
            "cpu usage {pct:.1}% above {:.1}%",
            config.cpu_warning_threshold
        ));
    }

    let latency_ms = inputs.scheduler_latency.map(|d| d.as_micros() as f64 / 1000.0);
    if let Some(ms) = exceeds(latency_ms, config.latency_warning_ms) {
        warning.push(format!(
            "scheduler latency {ms:.1}ms above {:.1}ms",
            config.latency_warning_ms
        ));
    }

    if inputs.long_running_tasks > 0 {
        warning.push(format!(
            "{} task(s) running longer than {:?}",
            inputs.long_running_tasks,
            config.max_task_execution_time()
        ));
    }

    let verdict = if !critical.is_empty() {
        HealthVerdict::Critical
    } else if !warning.is_empty() {
        HealthVerdict::Warning
    } else {
        HealthVerdict::Healthy
    };

    critical.extend(warning);

    HealthStatus {
        verdict,
        reasons: critical,
        memory_usage_percent: inputs.memory_percent,
        cpu_usage_percent: inputs.cpu_percent,
        scheduler_latency_ms: latency_ms,
        active_tasks: inputs.active_tasks,
        avg_task_duration: inputs.avg_task_duration,
        error_rate: inputs.error_rate,
        open_breakers: inputs.open_breakers,
        long_running_tasks: inputs.long_running_tasks,
        snapshots_recorded: inputs.snapshots_recorded,
        uptime: inputs.uptime,
        monitoring: inputs.monitoring,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn config() -> GuardConfig {
        GuardConfig::default()
    }

    #[test]
    fn empty_inputs_are_healthy() {
        let status = evaluate(HealthInputs::default(), &config());
        assert_eq!(status.verdict, HealthVerdict::Healthy);
        assert!(status.reasons.is_empty());
        assert!(status.is_healthy());
    }

    #[test]
    fn open_breaker_is_critical() {
        let inputs = HealthInputs {
            open_breakers: vec!["db".into()],
            ..Default::default()
        };
        let status = evaluate(inputs, &config());
        assert_eq!(status.verdict, HealthVerdict::Critical);
        assert!(status.reasons[0].contains("db"));
    }

    #[test]
    fn open_breaker_dominates_memory_warning() {
        let inputs = HealthInputs {
            memory_percent: Some(95.0),
            open_breakers: vec!["db".into()],
            ..Default::default()
        };
        let status = evaluate(inputs, &config());
        assert_eq!(status.verdict, HealthVerdict::Critical);
        assert_eq!(status.reasons.len(), 2);
    }

    #[test]
    fn memory_boundary_is_strict() {
        let at = HealthInputs {
            memory_percent: Some(80.0),
            ..Default::default()
        };
        assert_eq!(evaluate(at, &config()).verdict, HealthVerdict::Healthy);

        let above = HealthInputs {
            memory_percent: Some(80.1),
            ..Default::default()
        };
        assert_eq!(evaluate(above, &config()).verdict, HealthVerdict::Warning);
    }

    #[test]
    fn cpu_above_threshold_warns() {
        let inputs = HealthInputs {
            cpu_percent: Some(97.0),
            ..Default::default()
        };
        let status = evaluate(inputs, &config());
        assert_eq!(status.verdict, HealthVerdict::Warning);
        assert!(status.reasons[0].starts_with("cpu usage"));
    }

    #[test]
    fn latency_boundary_is_strict() {
        let at = HealthInputs {
            scheduler_latency: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let status = evaluate(at, &config());
        assert_eq!(status.verdict, HealthVerdict::Healthy);
        assert_eq!(status.scheduler_latency_ms, Some(100.0));

        let above = HealthInputs {
            scheduler_latency: Some(Duration::from_millis(101)),
            ..Default::default()
        };
        assert_eq!(evaluate(above, &config()).verdict, HealthVerdict::Warning);
    }

    #[test]
    fn error_rate_warning_and_critical_bands() {
        let rate = |r: f64| HealthInputs {
            error_rate: Some(r),
            ..Default::default()
        };
        assert_eq!(evaluate(rate(0.1), &config()).verdict, HealthVerdict::Healthy);
        assert_eq!(evaluate(rate(0.2), &config()).verdict, HealthVerdict::Warning);
        assert_eq!(evaluate(rate(0.5), &config()).verdict, HealthVerdict::Warning);
        assert_eq!(evaluate(rate(0.75), &config()).verdict, HealthVerdict::Critical);
    }

    #[test]
    fn long_running_task_warns() {
        let inputs = HealthInputs {
            long_running_tasks: 2,
            ..Default::default()
        };
        let status = evaluate(inputs, &config());
        assert_eq!(status.verdict, HealthVerdict::Warning);
        assert!(status.reasons[0].starts_with("2 task(s)"));
    }

    #[test]
    fn unknown_figures_never_trip() {
        let strict = GuardConfig {
            memory_warning_threshold: 0.0,
            cpu_warning_threshold: 0.0,
            latency_warning_ms: 0.0,
            error_rate_warning: 0.0,
            error_rate_critical: 0.0,
            ..Default::default()
        };
        let status = evaluate(HealthInputs::default(), &strict);
        assert_eq!(status.verdict, HealthVerdict::Healthy);
        assert_eq!(status.memory_usage_percent, None);
    }

    #[test]
    fn status_serializes_verdict_lowercase() {
        let status = evaluate(
            HealthInputs {
                memory_percent: Some(99.0),
                ..Default::default()
            },
            &config(),
        );
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["verdict"], "warning");
        assert_eq!(json["memory_usage_percent"], 99.0);
        assert!(json["cpu_usage_percent"].is_null());
    }

    #[test]
    fn verdict_ordering_and_display() {
        assert!(HealthVerdict::Critical > HealthVerdict::Warning);
        assert!(HealthVerdict::Warning > HealthVerdict::Healthy);
        assert_eq!(HealthVerdict::Critical.to_string(), "critical");
    }
}
