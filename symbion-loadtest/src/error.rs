//! Error taxonomy for the load-test engine
//!
//! - `DeviceError` / `FleetError`: lifecycle misuse on a single actor
//! - `ScenarioError`: configuration, infrastructure and threshold failures
//! - `ConfigError`: loading the YAML run configuration
//!
//! Simulated operational failures (a device failing to send, update or
//! reconnect) are never errors: they are counted where they happen.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device already started: {0}")]
    AlreadyStarted(String),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("fleet start cancelled before all batches completed")]
    Cancelled,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("fleet already started")]
    AlreadyStarted,
    #[error("fleet has been stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("invalid scenario configuration: {0}")]
    Config(String),
    #[error("failed to start fleet: {0}")]
    FleetStart(#[source] FleetError),
    #[error("canary success rate {:.2}% below threshold {:.2}%", .success_rate * 100.0, .threshold * 100.0)]
    CanaryFailed { success_rate: f64, threshold: f64 },
    #[error("rollback triggered: rollout failure rate {:.2}% above threshold {:.2}%", .failure_rate * 100.0, .threshold * 100.0)]
    RolledBack { failure_rate: f64, threshold: f64 },
    #[error("scenario cancelled after {0:?}")]
    Cancelled(Duration),
    #[error("scenario failed: {}", join_violations(.0))]
    ThresholdViolations(Vec<String>),
}

impl ScenarioError {
    /// Violations listed by a failed run, empty for other kinds.
    pub fn violations(&self) -> &[String] {
        match self {
            ScenarioError::ThresholdViolations(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[String]) -> String {
    violations.join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violations_are_listed_in_one_message() {
        let err = ScenarioError::ThresholdViolations(vec![
            "success rate 80.00% below threshold 95.00%".into(),
            "p95 latency 40s exceeds threshold 30s".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("scenario failed: "));
        assert!(msg.contains("success rate"));
        assert!(msg.contains("p95 latency"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_canary_message_uses_percentages() {
        let err = ScenarioError::CanaryFailed { success_rate: 0.5, threshold: 0.95 };
        assert_eq!(err.to_string(), "canary success rate 50.00% below threshold 95.00%");
        assert!(err.violations().is_empty());
    }
}
