/**
 * SYMBION LOADTEST - Point d'entrée du banc de charge
 *
 * RÔLE : Charge la configuration (fichier YAML puis flags), lance les
 * scénarios activés l'un après l'autre et écrit `summary.json`.
 *
 * FONCTIONNEMENT : Ctrl-C annule le jeton racine ; chaque scénario en cours
 * s'arrête proprement et son rapport partiel est conservé. Code de sortie 1
 * si un scénario échoue.
 *
 * UTILITÉ : Outil de validation de capacité du backend avant mise en production.
 */

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use symbion_loadtest::config::{load_config, load_config_from, ProfileCounts};
use symbion_loadtest::scenarios::{
    NetworkResilienceConfig, NetworkResilienceScenario, OnboardingStormConfig, OnboardingStormScenario,
    ScenarioFleet, SteadyStateConfig, SteadyStateScenario, UpdateCampaignConfig, UpdateCampaignScenario,
};
use symbion_loadtest::{LoadTestConfig, Scenario, ScenarioReport};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "symbion-loadtest", version, about = "Fleet-scale load testing for the Symbion device backend")]
struct Cli {
    /// YAML configuration file (defaults to $SYMBION_LOADTEST_CONFIG or loadtest.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server URL to test
    #[arg(long)]
    server: Option<String>,

    /// Total number of devices to simulate
    #[arg(long)]
    devices: Option<usize>,

    /// Test duration (e.g. 10m, 1h30m)
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    duration: Option<Duration>,

    /// Output directory for results
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of full-featured devices (0 = auto)
    #[arg(long)]
    full_devices: Option<usize>,

    /// Number of constrained devices (0 = auto)
    #[arg(long)]
    constrained_devices: Option<usize>,

    /// Number of minimal devices (0 = auto)
    #[arg(long)]
    minimal_devices: Option<usize>,

    /// Run onboarding storm scenario
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    onboarding: Option<bool>,

    /// Run steady state scenario
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    steady_state: Option<bool>,

    /// Run update campaign scenario
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    update_campaign: Option<bool>,

    /// Run network resilience scenario
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    network_resilience: Option<bool>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Authentication token
    #[arg(long)]
    auth_token: Option<String>,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Target requests per second
    #[arg(long)]
    target_rps: Option<f64>,

    /// Maximum acceptable latency (e.g. 100ms)
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    max_latency: Option<Duration>,

    /// Minimum success rate
    #[arg(long)]
    min_success_rate: Option<f64>,
}

impl Cli {
    fn apply(&self, config: &mut LoadTestConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(devices) = self.devices {
            config.total_devices = devices;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if self.full_devices.is_some() || self.constrained_devices.is_some() || self.minimal_devices.is_some() {
            config.profiles = ProfileCounts {
                full: self.full_devices.unwrap_or(config.profiles.full),
                constrained: self.constrained_devices.unwrap_or(config.profiles.constrained),
                minimal: self.minimal_devices.unwrap_or(config.profiles.minimal),
            };
        }
        let toggles = &mut config.scenarios;
        toggles.onboarding = self.onboarding.unwrap_or(toggles.onboarding);
        toggles.steady_state = self.steady_state.unwrap_or(toggles.steady_state);
        toggles.update_campaign = self.update_campaign.unwrap_or(toggles.update_campaign);
        toggles.network_resilience = self.network_resilience.unwrap_or(toggles.network_resilience);

        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        if self.tls {
            config.tls_enabled = true;
        }
        if let Some(rps) = self.target_rps {
            config.targets.target_rps = rps;
        }
        if let Some(latency) = self.max_latency {
            config.targets.max_latency = latency;
        }
        if let Some(rate) = self.min_success_rate {
            config.targets.min_success_rate = rate;
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    passed: bool,
    cancelled: bool,
    config: &'a LoadTestConfig,
    scenarios: &'a [ScenarioReport],
}

/// Paramètres de flotte communs issus de la configuration de run
fn fleet_for(config: &LoadTestConfig, base: ScenarioFleet) -> ScenarioFleet {
    base.with_devices(config.total_devices)
        .with_distribution(config.profiles.shares())
        .with_server(config.server_url.clone(), config.tls_enabled, config.auth_token.clone())
}

fn onboarding_config(config: &LoadTestConfig) -> OnboardingStormConfig {
    let defaults = OnboardingStormConfig::default();
    OnboardingStormConfig {
        fleet: fleet_for(config, defaults.fleet.clone()),
        test_duration: config.duration / 4,
        burst_size: 50,
        burst_interval: Duration::from_secs(2),
        success_threshold: config.targets.min_success_rate,
        ..defaults
    }
}

fn steady_state_config(config: &LoadTestConfig) -> SteadyStateConfig {
    let targets = &config.targets;
    let defaults = SteadyStateConfig::default();
    SteadyStateConfig {
        fleet: fleet_for(config, defaults.fleet.clone()),
        test_duration: config.duration / 2,
        warmup: Duration::from_secs(60),
        metrics_target_rate: targets.target_rps / 2.0,
        heartbeat_target_rate: targets.target_rps / 4.0,
        max_error_rate: 1.0 - targets.min_success_rate,
        max_latency: targets.max_latency,
        ..defaults
    }
}

fn update_campaign_config(config: &LoadTestConfig) -> UpdateCampaignConfig {
    let defaults = UpdateCampaignConfig::default();
    UpdateCampaignConfig {
        fleet: fleet_for(config, defaults.fleet.clone()),
        test_duration: config.duration / 3,
        update_batch_size: 25,
        update_batch_interval: Duration::from_secs(60),
        update_success_rate: config.targets.min_success_rate,
        update_duration: Duration::from_secs(2 * 60),
        rollback_threshold: 0.2,
        canary_percentage: 0.05,
        ..defaults
    }
}

fn network_resilience_config(config: &LoadTestConfig) -> NetworkResilienceConfig {
    let defaults = NetworkResilienceConfig::default();
    NetworkResilienceConfig {
        fleet: fleet_for(config, defaults.fleet.clone()),
        test_duration: config.duration / 3,
        recovery_target: Duration::from_secs(30),
        max_reconnect_attempts: 5,
        ..defaults
    }
}

fn build_scenarios(config: &LoadTestConfig) -> Vec<Box<dyn Scenario>> {
    let mut scenarios: Vec<Box<dyn Scenario>> = Vec::new();
    if config.scenarios.onboarding {
        scenarios.push(Box::new(OnboardingStormScenario::new(onboarding_config(config))));
    }
    if config.scenarios.steady_state {
        scenarios.push(Box::new(SteadyStateScenario::new(steady_state_config(config))));
    }
    if config.scenarios.update_campaign {
        scenarios.push(Box::new(UpdateCampaignScenario::new(update_campaign_config(config))));
    }
    if config.scenarios.network_resilience {
        scenarios.push(Box::new(NetworkResilienceScenario::new(network_resilience_config(config))));
    }
    scenarios
}

async fn run_scenario(scenario: &dyn Scenario, cancel: &CancellationToken) -> ScenarioReport {
    info!(scenario = scenario.name(), description = scenario.description(), "running scenario");
    let started = Instant::now();
    match scenario.run(cancel.child_token()).await {
        Ok(report) => {
            info!(scenario = scenario.name(), duration = ?report.duration, "scenario completed successfully");
            report
        }
        Err(e) => {
            error!(scenario = scenario.name(), "scenario completed with error: {e}");
            ScenarioReport::failed(scenario.name(), started.elapsed(), scenario.metrics_snapshot(), &e)
        }
    }
}

async fn write_summary(config: &LoadTestConfig, summary: &Summary<'_>) -> Result<PathBuf> {
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("failed to create output directory {}", config.output_dir.display()))?;
    let path = config.output_dir.join("summary.json");
    let json = serde_json::to_vec_pretty(summary).context("failed to serialize summary")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path).await,
        None => load_config().await,
    }
    .context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        server = %config.server_url,
        total_devices = config.total_devices,
        full = config.profiles.full,
        constrained = config.profiles.constrained,
        minimal = config.profiles.minimal,
        duration = ?config.duration,
        target_rps = config.targets.target_rps,
        max_latency = ?config.targets.max_latency,
        min_success_rate = config.targets.min_success_rate,
        "starting symbion load test"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, stopping load test");
            interrupt.cancel();
        }
    });

    let started_at = Utc::now();
    let mut reports = Vec::new();
    for scenario in build_scenarios(&config) {
        if cancel.is_cancelled() {
            break;
        }
        reports.push(run_scenario(scenario.as_ref(), &cancel).await);
    }

    let passed = reports.iter().all(|r| r.passed);
    let summary = Summary {
        started_at,
        finished_at: Utc::now(),
        passed,
        cancelled: cancel.is_cancelled(),
        config: &config,
        scenarios: &reports,
    };
    let path = write_summary(&config, &summary).await?;

    println!("\n=== LOAD TEST SUMMARY ===");
    for report in &reports {
        let status = if report.passed { "PASS" } else { "FAIL" };
        let duration = format!("{:?}", report.duration);
        match &report.error {
            Some(err) => println!("{status:<5} {:<20} {duration:>12}  {err}", report.name),
            None => println!("{status:<5} {:<20} {duration:>12}", report.name),
        }
    }
    println!("Results written to {}", path.display());

    Ok(if passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;
    use symbion_loadtest::config::ScenarioToggles;
    use symbion_loadtest::DeviceProfile;

    fn configured(args: &[&str]) -> LoadTestConfig {
        let cli = Cli::parse_from(std::iter::once("symbion-loadtest").chain(args.iter().copied()));
        let mut config = LoadTestConfig::default();
        cli.apply(&mut config);
        config
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = configured(&[
            "--server", "https://backend:9443",
            "--devices", "200",
            "--duration", "1h",
            "--output", "/tmp/results",
            "--auth-token", "secret",
            "--tls",
            "--target-rps", "400",
            "--max-latency", "250ms",
            "--min-success-rate", "0.9",
        ]);
        assert_eq!(config.server_url, "https://backend:9443");
        assert_eq!(config.total_devices, 200);
        assert_eq!(config.duration, Duration::from_secs(3600));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/results"));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert!(config.tls_enabled);
        assert_eq!(config.targets.target_rps, 400.0);
        assert_eq!(config.targets.max_latency, Duration::from_millis(250));
        assert_eq!(config.targets.min_success_rate, 0.9);

        // sans comptes explicites la répartition reste automatique
        config.validate().unwrap();
        assert_eq!(config.profiles, ProfileCounts { full: 60, constrained: 100, minimal: 40 });
    }

    #[test]
    fn test_scenario_toggles() {
        let config = configured(&["--network-resilience", "--steady-state", "false"]);
        assert!(config.scenarios.onboarding);
        assert!(!config.scenarios.steady_state);
        assert!(!config.scenarios.update_campaign);
        assert!(config.scenarios.network_resilience);

        let names: Vec<_> = build_scenarios(&config).iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["onboarding_storm", "network_resilience"]);

        let untouched = configured(&[]);
        assert_eq!(untouched.scenarios, ScenarioToggles::default());
    }

    #[test]
    fn test_partial_profile_counts_keep_the_others() {
        let mut config = LoadTestConfig::default();
        config.profiles = ProfileCounts { full: 10, constrained: 20, minimal: 70 };
        Cli::parse_from(["symbion-loadtest", "--minimal-devices", "30", "--devices", "60"]).apply(&mut config);
        assert_eq!(config.profiles, ProfileCounts { full: 10, constrained: 20, minimal: 30 });
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_scenario_configs() {
        let mut config = configured(&[
            "--devices", "100",
            "--duration", "12m",
            "--target-rps", "400",
            "--min-success-rate", "0.9",
            "--max-latency", "200ms",
            "--full-devices", "50",
            "--constrained-devices", "25",
            "--minimal-devices", "25",
        ]);
        config.validate().unwrap();

        let steady = steady_state_config(&config);
        assert_eq!(steady.test_duration, Duration::from_secs(6 * 60));
        assert_eq!(steady.warmup, Duration::from_secs(60));
        assert_eq!(steady.metrics_target_rate, 200.0);
        assert_eq!(steady.heartbeat_target_rate, 100.0);
        assert!((steady.max_error_rate - 0.1).abs() < 1e-9);
        assert_eq!(steady.max_latency, Duration::from_millis(200));
        assert_eq!(steady.fleet.total_devices, 100);
        assert_eq!(steady.fleet.profile_distribution[&DeviceProfile::Full], 0.5);
        assert_eq!(steady.fleet.profile_distribution[&DeviceProfile::Minimal], 0.25);

        let onboarding = onboarding_config(&config);
        assert_eq!(onboarding.test_duration, Duration::from_secs(3 * 60));
        assert_eq!(onboarding.burst_size, 50);
        assert_eq!(onboarding.success_threshold, 0.9);

        let update = update_campaign_config(&config);
        assert_eq!(update.test_duration, Duration::from_secs(4 * 60));
        assert_eq!(update.update_batch_size, 25);
        assert_eq!(update.update_success_rate, 0.9);
        assert_eq!(update.canary_percentage, 0.05);

        let network = network_resilience_config(&config);
        assert_eq!(network.test_duration, Duration::from_secs(4 * 60));
        assert_eq!(network.recovery_target, Duration::from_secs(30));
        assert_eq!(network.max_reconnect_attempts, 5);
        assert_eq!(network.fleet.server_url, config.server_url);
    }
}
