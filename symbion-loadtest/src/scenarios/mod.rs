/**
 * SCENARIOS - Scénarios de charge pilotant une flotte simulée
 *
 * RÔLE : Chaque scénario construit sa flotte, la démarre, applique ses phases
 * (rafale d'onboarding, régime établi avec churn, campagne de mise à jour,
 * perturbations réseau) puis juge le résultat contre ses seuils.
 *
 * FONCTIONNEMENT : Un scénario expose `run(cancel)` ; toutes les violations de
 * seuil sont rassemblées dans une seule erreur. L'arrêt de la flotte passe
 * toujours par `common::guarded`, succès ou échec.
 *
 * UTILITÉ : Unités exécutées séquentiellement par le binaire `symbion-loadtest`.
 */

pub mod backoff;
pub mod common;
pub mod network_resilience;
pub mod onboarding_storm;
pub mod stats;
pub mod steady_state;
pub mod update_campaign;

pub use backoff::ReconnectBackoff;
pub use common::{distribute_profiles, guarded, RateSampler, Violations};
pub use network_resilience::{NetworkResilienceConfig, NetworkResilienceScenario};
pub use onboarding_storm::{OnboardingStormConfig, OnboardingStormScenario};
pub use steady_state::{SteadyStateConfig, SteadyStateScenario};
pub use update_campaign::{UpdateCampaignConfig, UpdateCampaignScenario};

use crate::device::DeviceProfile;
use crate::error::ScenarioError;
use crate::fleet::{DeviceTiming, FleetConfig, FleetSimulator};
use crate::random::SharedRandom;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Current scenario metrics as JSON, available even after a failed run.
    fn metrics_snapshot(&self) -> Value;

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<ScenarioReport, ScenarioError>>;
}

/// Outcome of one scenario run, as collected by the runner
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub metrics: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn passed(name: &str, duration: Duration, metrics: Value) -> Self {
        Self { name: name.to_string(), passed: true, duration, metrics, error: None }
    }

    pub fn failed(name: &str, duration: Duration, metrics: Value, error: &ScenarioError) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration,
            metrics,
            error: Some(error.to_string()),
        }
    }
}

/// Paramètres de flotte communs à tous les scénarios
#[derive(Debug, Clone)]
pub struct ScenarioFleet {
    pub total_devices: usize,
    pub profile_distribution: BTreeMap<DeviceProfile, f64>,
    pub server_url: String,
    pub auth_token: Option<String>,
    pub tls_enabled: bool,
    pub startup_batch_size: usize,
    pub startup_batch_interval: Duration,
    pub max_concurrent_requests: usize,
    pub device_timing: Option<DeviceTiming>,
}

impl ScenarioFleet {
    pub fn new(distribution: [f64; 3], batch_size: usize, batch_interval: Duration, concurrency: usize) -> Self {
        Self {
            total_devices: 1000,
            profile_distribution: BTreeMap::from([
                (DeviceProfile::Full, distribution[0]),
                (DeviceProfile::Constrained, distribution[1]),
                (DeviceProfile::Minimal, distribution[2]),
            ]),
            server_url: "http://localhost:8080".to_string(),
            auth_token: None,
            tls_enabled: false,
            startup_batch_size: batch_size,
            startup_batch_interval: batch_interval,
            max_concurrent_requests: concurrency,
            device_timing: None,
        }
    }

    pub fn with_devices(mut self, total_devices: usize) -> Self {
        self.total_devices = total_devices;
        self
    }

    pub fn with_distribution(mut self, distribution: BTreeMap<DeviceProfile, f64>) -> Self {
        self.profile_distribution = distribution;
        self
    }

    pub fn with_server(mut self, url: impl Into<String>, tls_enabled: bool, auth_token: Option<String>) -> Self {
        self.server_url = url.into();
        self.tls_enabled = tls_enabled;
        self.auth_token = auth_token;
        self
    }

    pub fn with_timing(mut self, timing: DeviceTiming) -> Self {
        self.device_timing = Some(timing);
        self
    }

    pub fn with_batches(mut self, size: usize, interval: Duration, concurrency: usize) -> Self {
        self.startup_batch_size = size;
        self.startup_batch_interval = interval;
        self.max_concurrent_requests = concurrency;
        self
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.total_devices == 0 {
            return Err(ScenarioError::Config("total_devices must be greater than 0".into()));
        }
        if self.server_url.trim().is_empty() {
            return Err(ScenarioError::Config("server_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn build(&self, parent: &CancellationToken, rng: SharedRandom, test_duration: Duration) -> FleetSimulator {
        let mut config = FleetConfig::with_profiles(distribute_profiles(self.total_devices, &self.profile_distribution))
            .with_batches(self.startup_batch_size, self.startup_batch_interval, self.max_concurrent_requests);
        config.server_url = self.server_url.clone();
        config.auth_token = self.auth_token.clone();
        config.tls_enabled = self.tls_enabled;
        config.test_duration = test_duration;
        config.device_timing = self.device_timing;
        FleetSimulator::new(config).with_random(rng).with_parent(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::FixedRandom;
    use std::sync::Arc;

    #[test]
    fn test_report_serialization() {
        let err = ScenarioError::ThresholdViolations(vec!["a".into(), "b".into()]);
        let report = ScenarioReport::failed("steady_state", Duration::from_secs(90), serde_json::json!({"x": 1}), &err);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["duration"], "1m 30s");
        assert_eq!(json["error"], "scenario failed: a; b");

        let ok = ScenarioReport::passed("onboarding_storm", Duration::from_secs(1), Value::Null);
        assert!(serde_json::to_value(&ok).unwrap().get("error").is_none());
    }

    #[test]
    fn test_scenario_fleet_build() {
        let fleet = ScenarioFleet::new([0.3, 0.5, 0.2], 100, Duration::from_secs(1), 500)
            .with_devices(101)
            .build(&CancellationToken::new(), Arc::new(FixedRandom::new(0.5)), Duration::from_secs(60));
        let config = fleet.config();
        assert_eq!(config.device_profiles.values().sum::<usize>(), 101);
        assert_eq!(config.total_devices, 101);
        assert_eq!(config.startup_batch_size, 100);
        assert_eq!(config.max_concurrent_requests, 500);

        let invalid = ScenarioFleet::new([1.0, 0.0, 0.0], 1, Duration::ZERO, 1).with_devices(0);
        assert!(matches!(invalid.validate(), Err(ScenarioError::Config(_))));
    }
}
