//! Run configuration for the load-test binary
//!
//! - YAML file named by `SYMBION_LOADTEST_CONFIG` (default `loadtest.yaml`)
//! - Missing or empty file: defaults
//! - Durations in humantime form (`"30s"`, `"10m"`)
//! - Command-line flags override file values before `validate()`

use crate::device::DeviceProfile;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "SYMBION_LOADTEST_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "loadtest.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    pub server_url: String,
    pub total_devices: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub output_dir: PathBuf,
    pub auth_token: Option<String>,
    pub tls_enabled: bool,
    pub profiles: ProfileCounts,
    pub scenarios: ScenarioToggles,
    pub targets: Targets,
}

/// Nombre explicite de devices par profil ; tout à 0 = répartition automatique
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCounts {
    pub full: usize,
    pub constrained: usize,
    pub minimal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioToggles {
    pub onboarding: bool,
    pub steady_state: bool,
    pub update_campaign: bool,
    pub network_resilience: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targets {
    pub target_rps: f64,
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    pub min_success_rate: f64,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            total_devices: 100,
            duration: Duration::from_secs(10 * 60),
            output_dir: PathBuf::from("./load_test_results"),
            auth_token: None,
            tls_enabled: false,
            profiles: ProfileCounts::default(),
            scenarios: ScenarioToggles::default(),
            targets: Targets::default(),
        }
    }
}

impl Default for ScenarioToggles {
    fn default() -> Self {
        Self {
            onboarding: true,
            steady_state: true,
            update_campaign: false,
            network_resilience: false,
        }
    }
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            target_rps: 1000.0,
            max_latency: Duration::from_millis(100),
            min_success_rate: 0.95,
        }
    }
}

impl ProfileCounts {
    pub fn total(&self) -> usize {
        self.full + self.constrained + self.minimal
    }

    pub fn is_auto(&self) -> bool {
        self.total() == 0
    }

    /// 30% full, 50% constrained, le reste en minimal.
    pub fn auto(total: usize) -> Self {
        let full = (total as f64 * 0.3) as usize;
        let constrained = (total as f64 * 0.5) as usize;
        Self { full, constrained, minimal: total - full - constrained }
    }

    /// Counts as fractions of the total, the form scenarios distribute from.
    pub fn shares(&self) -> BTreeMap<DeviceProfile, f64> {
        let total = self.total().max(1) as f64;
        BTreeMap::from([
            (DeviceProfile::Full, self.full as f64 / total),
            (DeviceProfile::Constrained, self.constrained as f64 / total),
            (DeviceProfile::Minimal, self.minimal as f64 / total),
        ])
    }
}

impl LoadTestConfig {
    /// Vérifie la configuration et résout la répartition automatique des profils.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.total_devices == 0 {
            return Err(ConfigError::Invalid("total devices must be greater than 0".into()));
        }
        if self.duration.is_zero() {
            return Err(ConfigError::Invalid("test duration must be greater than 0".into()));
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server URL cannot be empty".into()));
        }
        if !(self.targets.target_rps > 0.0) {
            return Err(ConfigError::Invalid("target RPS must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.targets.min_success_rate) {
            return Err(ConfigError::Invalid("minimum success rate must be between 0 and 1".into()));
        }

        if self.profiles.is_auto() {
            self.profiles = ProfileCounts::auto(self.total_devices);
        }
        let total = self.profiles.total();
        if total != self.total_devices {
            return Err(ConfigError::Invalid(format!(
                "device profile counts ({total}) don't match total devices ({})",
                self.total_devices
            )));
        }
        Ok(())
    }
}

/// Lit la configuration depuis le fichier désigné par `SYMBION_LOADTEST_CONFIG`.
pub async fn load_config() -> Result<LoadTestConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> Result<LoadTestConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        info!(path = %path.display(), "no load-test config file, using defaults");
        return Ok(LoadTestConfig::default());
    }

    let txt = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if txt.trim().is_empty() {
        warn!(path = %path.display(), "empty load-test config file, using defaults");
        return Ok(LoadTestConfig::default());
    }
    Ok(serde_yaml::from_str(&txt)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_and_empty_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config_from(dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(missing, LoadTestConfig::default());

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(load_config_from(&empty).await.unwrap(), LoadTestConfig::default());
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server_url: https://fleet.example:8443\ntotal_devices: 500\nduration: 20m\n\
             scenarios:\n  network_resilience: true\ntargets:\n  max_latency: 250ms"
        )
        .unwrap();

        let config = load_config_from(file.path()).await.unwrap();
        assert_eq!(config.server_url, "https://fleet.example:8443");
        assert_eq!(config.total_devices, 500);
        assert_eq!(config.duration, Duration::from_secs(20 * 60));
        assert!(config.scenarios.network_resilience);
        assert!(config.scenarios.onboarding);
        assert_eq!(config.targets.max_latency, Duration::from_millis(250));
        assert_eq!(config.targets.target_rps, 1000.0);
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "total_devices: [not, a, number]").unwrap();
        let err = load_config_from(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_auto_profile_split() {
        let mut config = LoadTestConfig { total_devices: 101, ..Default::default() };
        config.validate().unwrap();
        assert_eq!(config.profiles, ProfileCounts { full: 30, constrained: 50, minimal: 21 });
    }

    #[test]
    fn test_validation_rules() {
        let invalid = [
            LoadTestConfig { total_devices: 0, ..Default::default() },
            LoadTestConfig { duration: Duration::ZERO, ..Default::default() },
            LoadTestConfig { server_url: " ".into(), ..Default::default() },
            LoadTestConfig {
                targets: Targets { target_rps: 0.0, ..Default::default() },
                ..Default::default()
            },
            LoadTestConfig {
                targets: Targets { min_success_rate: 1.5, ..Default::default() },
                ..Default::default()
            },
            LoadTestConfig {
                profiles: ProfileCounts { full: 10, constrained: 10, minimal: 10 },
                ..Default::default()
            },
        ];
        for mut config in invalid {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }

        let mut explicit = LoadTestConfig {
            profiles: ProfileCounts { full: 100, constrained: 0, minimal: 0 },
            ..Default::default()
        };
        explicit.validate().unwrap();
        assert_eq!(explicit.profiles.shares()[&DeviceProfile::Full], 1.0);
    }
}
