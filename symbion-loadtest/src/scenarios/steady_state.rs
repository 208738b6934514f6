/**
 * STEADY STATE - Charge continue d'une flotte stable avec churn
 *
 * RÔLE : Fait tourner la flotte en régime établi et vérifie les débits de
 * métriques et de heartbeats ainsi que le taux d'erreur.
 *
 * FONCTIONNEMENT :
 * - Démarrage, warmup, puis remise à zéro des lignes de base
 * - Fenêtre de mesure : moniteur (1s), échantillons de débit (10s) et churn
 *   périodique d'un préfixe de la flotte, jamais redémarré après la fin
 * - Les débits finaux sont des moyennes sur la fenêtre de mesure
 *
 * UTILITÉ : Référence de capacité nominale du backend.
 */

use super::common::{guarded, pause, percent, start_fleet, RateSampler, Violations};
use super::stats::{coefficient_of_variation, mean};
use super::{Scenario, ScenarioFleet, ScenarioReport};
use crate::device::VirtualDevice;
use crate::error::{DeviceError, ScenarioError};
use crate::fleet::{FleetMetrics, FleetSimulator};
use crate::random::{thread_random, RandomSource, SharedRandom};
use crate::timing::sleep_or_cancel;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tolérance appliquée aux débits cibles
const TARGET_TOLERANCE: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct SteadyStateConfig {
    pub fleet: ScenarioFleet,
    /// Measurement window, after warmup
    pub test_duration: Duration,
    pub warmup: Duration,
    /// Metrics per second; 0 disables the check
    pub metrics_target_rate: f64,
    /// Heartbeats per second; 0 disables the check
    pub heartbeat_target_rate: f64,
    pub max_error_rate: f64,
    pub max_latency: Duration,
    pub churn_rate: f64,
    pub churn_interval: Duration,
    pub churn_downtime: (Duration, Duration),
    pub monitor_interval: Duration,
    pub throughput_interval: Duration,
    pub stability_warning_cv: f64,
}

impl Default for SteadyStateConfig {
    fn default() -> Self {
        Self {
            fleet: ScenarioFleet::new([0.3, 0.5, 0.2], 50, Duration::from_secs(2), 200),
            test_duration: Duration::from_secs(30 * 60),
            warmup: Duration::from_secs(5 * 60),
            metrics_target_rate: 0.0,
            heartbeat_target_rate: 0.0,
            max_error_rate: 0.05,
            max_latency: Duration::from_secs(10),
            churn_rate: 0.1,
            churn_interval: Duration::from_secs(10 * 60),
            churn_downtime: (Duration::from_secs(30), Duration::from_secs(150)),
            monitor_interval: Duration::from_secs(1),
            throughput_interval: Duration::from_secs(10),
            stability_warning_cv: 0.3,
        }
    }
}

impl SteadyStateConfig {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.fleet.validate()?;
        if self.test_duration.is_zero() {
            return Err(ScenarioError::Config("test_duration must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.churn_rate) {
            return Err(ScenarioError::Config("churn_rate must be within [0, 1]".into()));
        }
        if self.churn_downtime.0 > self.churn_downtime.1 {
            return Err(ScenarioError::Config("churn_downtime minimum exceeds maximum".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSample {
    pub timestamp: DateTime<Utc>,
    pub metrics_per_sec: f64,
    pub heartbeats_per_sec: f64,
    pub errors_per_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SteadyStateMetrics {
    /// Start of the measurement window
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub devices_online: usize,
    pub devices_offline: usize,
    pub total_metrics_sent: u64,
    pub total_heartbeats_sent: u64,
    pub total_errors: u64,
    pub metrics_rate: f64,
    pub heartbeat_rate: f64,
    pub error_rate: f64,
    pub current_metrics_rate: f64,
    pub current_heartbeat_rate: f64,
    pub throughput: Vec<ThroughputSample>,
    pub mean_metrics_rate: f64,
    pub throughput_cv: f64,
    pub churn_rounds: u64,
    pub devices_churned: u64,
}

/// Compteurs cumulés de la flotte au début de la fenêtre
#[derive(Debug, Clone, Copy)]
struct Baseline {
    at: Instant,
    metrics: u64,
    heartbeats: u64,
    errors: u64,
}

impl Baseline {
    fn capture(fleet: &FleetMetrics) -> Self {
        Self {
            at: Instant::now(),
            metrics: fleet.total_metrics_sent,
            heartbeats: fleet.total_messages_sent,
            errors: fleet.total_errors,
        }
    }
}

#[derive(Debug, Default)]
struct ThroughputSamplers {
    metrics: RateSampler,
    heartbeats: RateSampler,
    errors: RateSampler,
}

impl ThroughputSamplers {
    fn reset(&mut self) {
        self.metrics.reset();
        self.heartbeats.reset();
        self.errors.reset();
    }
}

/// Errors over attempted sends; an error-only window counts as a full failure.
fn error_ratio(errors: u64, metrics: u64, heartbeats: u64) -> f64 {
    let sent = metrics + heartbeats;
    match (errors, sent) {
        (0, _) => 0.0,
        (_, 0) => 1.0,
        _ => errors as f64 / sent as f64,
    }
}

pub struct SteadyStateScenario {
    config: SteadyStateConfig,
    rng: SharedRandom,
    metrics: RwLock<SteadyStateMetrics>,
    baseline: Mutex<Option<Baseline>>,
    samplers: Mutex<ThroughputSamplers>,
}

impl SteadyStateScenario {
    pub fn new(config: SteadyStateConfig) -> Self {
        Self {
            config,
            rng: thread_random(),
            metrics: RwLock::new(SteadyStateMetrics::default()),
            baseline: Mutex::new(None),
            samplers: Mutex::new(ThroughputSamplers::default()),
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &SteadyStateConfig {
        &self.config
    }

    pub fn metrics(&self) -> SteadyStateMetrics {
        self.metrics.read().clone()
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ScenarioError> {
        self.config.validate()?;
        let started = Instant::now();
        *self.metrics.write() = SteadyStateMetrics::default();
        *self.baseline.lock() = None;
        self.samplers.lock().reset();

        info!(
            scenario = "steady_state",
            total_devices = self.config.fleet.total_devices,
            test_duration = ?self.config.test_duration,
            warmup = ?self.config.warmup,
            metrics_target_rate = self.config.metrics_target_rate,
            heartbeat_target_rate = self.config.heartbeat_target_rate,
            "starting steady state scenario"
        );

        let fleet = self.config.fleet.build(cancel, self.rng.clone(), self.config.test_duration);
        guarded(&fleet, async {
            start_fleet(&fleet, started).await?;

            let monitor_cancel = cancel.child_token();
            let (outcome, (), ()) = tokio::join!(
                async {
                    let outcome = self.phases(&fleet, cancel, started).await;
                    monitor_cancel.cancel();
                    outcome
                },
                self.monitor(&fleet, &monitor_cancel),
                self.sample_throughput(&fleet, &monitor_cancel),
            );
            outcome?;

            self.finalize(&fleet.refresh_metrics());
            self.analyze()
        })
        .await
    }

    async fn phases(&self, fleet: &FleetSimulator, cancel: &CancellationToken, started: Instant) -> Result<(), ScenarioError> {
        info!(duration = ?self.config.warmup, "starting warmup period");
        pause(cancel, self.config.warmup, started).await?;
        info!("warmup period completed");

        self.reset_window(&fleet.refresh_metrics());

        info!(duration = ?self.config.test_duration, "starting steady state test period");
        let window_end = Instant::now() + self.config.test_duration;
        let churn_stop = cancel.child_token();
        let (outcome, ()) = tokio::join!(
            async {
                let outcome = pause(cancel, self.config.test_duration, started).await;
                churn_stop.cancel();
                outcome
            },
            self.churn(fleet, window_end, &churn_stop, cancel),
        );
        outcome?;
        info!("steady state test completed");
        Ok(())
    }

    /// Déplace les lignes de base sur les compteurs cumulés courants.
    fn reset_window(&self, fleet: &FleetMetrics) {
        *self.baseline.lock() = Some(Baseline::capture(fleet));
        self.samplers.lock().reset();
        let mut m = self.metrics.write();
        m.started_at = Some(Utc::now());
        m.total_metrics_sent = 0;
        m.total_heartbeats_sent = 0;
        m.total_errors = 0;
        m.throughput.clear();
        m.churn_rounds = 0;
        m.devices_churned = 0;
    }

    async fn monitor(&self, fleet: &FleetSimulator, cancel: &CancellationToken) {
        let period = self.config.monitor_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut metrics_sampler = RateSampler::new();
        let mut heartbeat_sampler = RateSampler::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let fleet_metrics = fleet.metrics();
            let baseline = *self.baseline.lock();

            let mut m = self.metrics.write();
            m.devices_online = fleet_metrics.online;
            m.devices_offline = fleet_metrics.offline;
            if let Some(rate) = metrics_sampler.sample(now, fleet_metrics.total_metrics_sent) {
                m.current_metrics_rate = rate;
            }
            if let Some(rate) = heartbeat_sampler.sample(now, fleet_metrics.total_messages_sent) {
                m.current_heartbeat_rate = rate;
            }
            if let Some(base) = baseline {
                m.total_metrics_sent = fleet_metrics.total_metrics_sent.saturating_sub(base.metrics);
                m.total_heartbeats_sent = fleet_metrics.total_messages_sent.saturating_sub(base.heartbeats);
                m.total_errors = fleet_metrics.total_errors.saturating_sub(base.errors);
                m.error_rate = error_ratio(m.total_errors, m.total_metrics_sent, m.total_heartbeats_sent);
            }
            debug!(
                devices_online = m.devices_online,
                metrics_rate = m.current_metrics_rate,
                heartbeat_rate = m.current_heartbeat_rate,
                error_rate = m.error_rate,
                "steady state metrics"
            );
        }
    }

    async fn sample_throughput(&self, fleet: &FleetSimulator, cancel: &CancellationToken) {
        let period = self.config.throughput_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let fleet_metrics = fleet.metrics();
            let sample = {
                let mut samplers = self.samplers.lock();
                let metrics = samplers.metrics.sample(now, fleet_metrics.total_metrics_sent);
                let heartbeats = samplers.heartbeats.sample(now, fleet_metrics.total_messages_sent);
                let errors = samplers.errors.sample(now, fleet_metrics.total_errors);
                match (metrics, heartbeats, errors) {
                    (Some(metrics_per_sec), Some(heartbeats_per_sec), Some(errors_per_sec)) => Some(ThroughputSample {
                        timestamp: Utc::now(),
                        metrics_per_sec,
                        heartbeats_per_sec,
                        errors_per_sec,
                    }),
                    _ => None,
                }
            };
            if let Some(sample) = sample {
                self.metrics.write().throughput.push(sample);
            }
        }
    }

    /// Churn de la fenêtre de mesure. Un device n'est coupé que si son
    /// redémarrage tombe avant `window_end` ; les rebonds en cours sont attendus.
    async fn churn(&self, fleet: &FleetSimulator, window_end: Instant, stop: &CancellationToken, cancel: &CancellationToken) {
        let period = self.config.churn_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut outstanding = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let devices = fleet.list_devices();
            let count = ((devices.len() as f64) * self.config.churn_rate).floor() as usize;
            if count == 0 {
                continue;
            }

            let (low, high) = self.config.churn_downtime;
            let mut bounced = 0;
            for device in devices.into_iter().take(count) {
                let downtime = self.rng.duration_between(low, high);
                if Instant::now() + downtime > window_end {
                    continue;
                }
                outstanding.spawn(bounce(device, downtime, cancel.clone()));
                bounced += 1;
            }
            if bounced < count {
                debug!(skipped = count - bounced, "churn skipped: restart would land after the window");
            }
            if bounced > 0 {
                info!(devices_affected = bounced, "simulating device churn");
                let mut m = self.metrics.write();
                m.churn_rounds += 1;
                m.devices_churned += bounced as u64;
            }
            while outstanding.try_join_next().is_some() {}
        }
        while outstanding.join_next().await.is_some() {}
    }

    fn finalize(&self, fleet: &FleetMetrics) {
        let baseline = *self.baseline.lock();
        let mut m = self.metrics.write();
        m.ended_at = Some(Utc::now());
        m.devices_online = fleet.online;
        m.devices_offline = fleet.offline;

        if let Some(base) = baseline {
            m.total_metrics_sent = fleet.total_metrics_sent.saturating_sub(base.metrics);
            m.total_heartbeats_sent = fleet.total_messages_sent.saturating_sub(base.heartbeats);
            m.total_errors = fleet.total_errors.saturating_sub(base.errors);
            let window = base.at.elapsed().as_secs_f64();
            if window > 0.0 {
                m.metrics_rate = m.total_metrics_sent as f64 / window;
                m.heartbeat_rate = m.total_heartbeats_sent as f64 / window;
            }
            m.error_rate = error_ratio(m.total_errors, m.total_metrics_sent, m.total_heartbeats_sent);
        }

        let rates: Vec<f64> = m.throughput.iter().map(|s| s.metrics_per_sec).collect();
        m.mean_metrics_rate = mean(&rates);
        m.throughput_cv = coefficient_of_variation(&rates);

        info!(
            devices_online = m.devices_online,
            total_metrics_sent = m.total_metrics_sent,
            total_heartbeats_sent = m.total_heartbeats_sent,
            total_errors = m.total_errors,
            average_metrics_rate = m.metrics_rate,
            average_heartbeat_rate = m.heartbeat_rate,
            error_rate = m.error_rate,
            max_latency = ?self.config.max_latency,
            churn_rounds = m.churn_rounds,
            "steady state scenario results"
        );
        if rates.len() >= 2 {
            info!(
                mean_metrics_rate = m.mean_metrics_rate,
                coefficient_of_variation = m.throughput_cv,
                measurements = rates.len(),
                "throughput stability analysis"
            );
            if m.throughput_cv > self.config.stability_warning_cv {
                warn!(cv = m.throughput_cv, "high throughput variability detected");
            }
        }
    }

    fn analyze(&self) -> Result<(), ScenarioError> {
        let m = self.metrics.read();
        let cfg = &self.config;
        let mut violations = Violations::new();

        violations.check(cfg.metrics_target_rate > 0.0 && m.metrics_rate < cfg.metrics_target_rate * TARGET_TOLERANCE, || {
            format!("metrics rate {:.2}/s below target {}/s", m.metrics_rate, cfg.metrics_target_rate)
        });
        violations.check(
            cfg.heartbeat_target_rate > 0.0 && m.heartbeat_rate < cfg.heartbeat_target_rate * TARGET_TOLERANCE,
            || format!("heartbeat rate {:.2}/s below target {}/s", m.heartbeat_rate, cfg.heartbeat_target_rate),
        );
        violations.check(m.error_rate > cfg.max_error_rate, || {
            format!("error rate {} exceeds threshold {}", percent(m.error_rate), percent(cfg.max_error_rate))
        });

        if violations.is_empty() {
            info!("steady state scenario PASSED");
        }
        violations.into_result()
    }
}

/// Coupe un device pendant `downtime` puis le redémarre.
async fn bounce(device: Arc<VirtualDevice>, downtime: Duration, cancel: CancellationToken) {
    device.stop().await;
    debug!(device_id = %device.id(), ?downtime, "device churned offline");
    if !sleep_or_cancel(&cancel, downtime).await {
        return;
    }
    match device.start().await {
        Ok(()) => debug!(device_id = %device.id(), "device back online after churn"),
        Err(DeviceError::AlreadyStarted(_)) => {}
        Err(e) => warn!(device_id = %device.id(), "failed to restart device after churn: {e}"),
    }
}

impl Scenario for SteadyStateScenario {
    fn name(&self) -> &'static str {
        "steady_state"
    }

    fn description(&self) -> &'static str {
        "Simulates normal fleet operations with continuous metrics and heartbeats"
    }

    fn metrics_snapshot(&self) -> Value {
        serde_json::to_value(self.metrics()).unwrap_or(Value::Null)
    }

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<ScenarioReport, ScenarioError>> {
        Box::pin(async move {
            let started = Instant::now();
            self.execute(&cancel).await?;
            Ok(ScenarioReport::passed(self.name(), started.elapsed(), self.metrics_snapshot()))
        })
    }
}
