/**
 * NETWORK RESILIENCE - Perturbations réseau et reconnexion de la flotte
 *
 * RÔLE : Applique une série d'événements réseau (partition, latence,
 * connectivité intermittente...) à une fraction de la flotte et mesure la
 * capacité des devices à se reconnecter.
 *
 * FONCTIONNEMENT :
 * - Chaque événement tourne dans sa propre tâche, planifié depuis le début
 *   de la fenêtre de test
 * - Par device touché : perturbation, attente de la durée de l'événement,
 *   puis tentatives de reconnexion avec backoff exponentiel
 * - Un veilleur détecte les tempêtes de reconnexion, un moniteur calcule le
 *   score de santé réseau
 *
 * UTILITÉ : Vérifie que le backend absorbe les vagues de reconnexion.
 */

use super::common::{guarded, pause, percent, start_fleet, RateSampler, Violations};
use super::stats::{mean_duration, percentile};
use super::{ReconnectBackoff, Scenario, ScenarioFleet, ScenarioReport};
use crate::device::{DeviceProfile, VirtualDevice};
use crate::error::{DeviceError, ScenarioError};
use crate::fleet::{FleetMetrics, FleetSimulator};
use crate::random::{thread_random, RandomSource, SharedRandom};
use crate::timing::sleep_or_cancel;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_RECOVERY_RATE: f64 = 0.9;
const MIN_HEALTH_SCORE: f64 = 70.0;
const INTERMITTENT_DISCONNECT_CHANCE: f64 = 0.3;
const INTERMITTENT_MIN_WAIT: Duration = Duration::from_secs(5);
const INTERMITTENT_MAX_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEventType {
    /// Coupure complète : le device est arrêté
    Partition,
    Latency,
    PacketLoss,
    BandwidthLimit,
    DnsFailure,
    /// Déconnexions et reconnexions aléatoires pendant l'événement
    Intermittent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub event_type: NetworkEventType,
    /// Offset from the start of the test window
    #[serde(with = "humantime_serde")]
    pub start_after: Duration,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub affected_fraction: f64,
    pub severity: Severity,
    pub description: String,
}

impl NetworkEvent {
    pub fn new(
        event_type: NetworkEventType,
        start_after: Duration,
        duration: Duration,
        affected_fraction: f64,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            start_after,
            duration,
            affected_fraction,
            severity,
            description: description.into(),
        }
    }

    fn affected_count(&self, devices: usize) -> usize {
        (((devices as f64) * self.affected_fraction.clamp(0.0, 1.0)).floor() as usize).min(devices)
    }
}

pub fn default_events() -> Vec<NetworkEvent> {
    vec![
        NetworkEvent::new(
            NetworkEventType::Partition,
            Duration::from_secs(2 * 60),
            Duration::from_secs(30),
            0.2,
            Severity::High,
            "Network partition affecting 20% of devices",
        ),
        NetworkEvent::new(
            NetworkEventType::Latency,
            Duration::from_secs(5 * 60),
            Duration::from_secs(2 * 60),
            0.5,
            Severity::Medium,
            "High latency affecting 50% of devices",
        ),
        NetworkEvent::new(
            NetworkEventType::Intermittent,
            Duration::from_secs(8 * 60),
            Duration::from_secs(5 * 60),
            0.3,
            Severity::Medium,
            "Intermittent connectivity affecting 30% of devices",
        ),
    ]
}

/// Probabilité de succès d'une tentative de reconnexion
pub trait RecoveryModel: Send + Sync {
    fn attempt_probability(&self, profile: DeviceProfile, severity: Severity, attempt: u32) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileRecoveryModel;

impl RecoveryModel for ProfileRecoveryModel {
    fn attempt_probability(&self, profile: DeviceProfile, severity: Severity, _attempt: u32) -> f64 {
        let base = match profile {
            DeviceProfile::Full => 0.8,
            DeviceProfile::Constrained => 0.6,
            DeviceProfile::Minimal => 0.4,
        };
        match severity {
            Severity::High => base * 0.7,
            Severity::Critical => base * 0.5,
            Severity::Low | Severity::Medium => base,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkResilienceConfig {
    pub fleet: ScenarioFleet,
    pub test_duration: Duration,
    pub events: Vec<NetworkEvent>,
    /// Devices reconnecting within this delay count as quick recoveries
    pub recovery_target: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff: ReconnectBackoff,
    pub settle_time: Duration,
    pub storm_threshold: f64,
    pub storm_check_interval: Duration,
    pub health_check_interval: Duration,
}

impl Default for NetworkResilienceConfig {
    fn default() -> Self {
        Self {
            fleet: ScenarioFleet::new([0.3, 0.5, 0.2], 100, Duration::from_secs(1), 1000),
            test_duration: Duration::from_secs(15 * 60),
            events: default_events(),
            recovery_target: Duration::from_secs(2 * 60),
            max_reconnect_attempts: 5,
            backoff: ReconnectBackoff::default(),
            settle_time: Duration::from_secs(30),
            storm_threshold: 50.0,
            storm_check_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5),
        }
    }
}

impl NetworkResilienceConfig {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.fleet.validate()?;
        if self.max_reconnect_attempts == 0 {
            return Err(ScenarioError::Config("max_reconnect_attempts must be greater than 0".into()));
        }
        if let Some(event) = self.events.iter().find(|e| !(0.0..=1.0).contains(&e.affected_fraction)) {
            return Err(ScenarioError::Config(format!(
                "network event '{}' affects {} of the fleet, expected a fraction within [0, 1]",
                event.description, event.affected_fraction
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEventMetrics {
    pub event: NetworkEvent,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub devices_affected: usize,
    pub recovered_quickly: u64,
    pub recovered_slow: u64,
    pub failed_to_recover: u64,
    #[serde(with = "humantime_serde")]
    pub average_recovery_time: Duration,
}

/// Fenêtre pendant laquelle le débit de reconnexion dépasse le seuil
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionStorm {
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub peak_rate: f64,
    pub attempts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkResilienceMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_devices: usize,
    pub devices_affected: usize,
    pub devices_recovered: u64,
    pub devices_failed_to_recover: u64,
    pub network_events_executed: u64,
    pub reconnection_attempts: u64,
    pub successful_reconnections: u64,
    pub failed_reconnections: u64,
    #[serde(with = "humantime_serde")]
    pub average_recovery_time: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_recovery_time: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_recovery_time: Duration,
    #[serde(skip)]
    pub recovery_times: Vec<Duration>,
    pub events: Vec<NetworkEventMetrics>,
    pub storms: Vec<ReconnectionStorm>,
    pub peak_reconnect_rate: f64,
    pub network_health_score: f64,
}

impl NetworkResilienceMetrics {
    pub fn recovery_rate(&self) -> f64 {
        if self.devices_affected == 0 {
            return 1.0;
        }
        self.devices_recovered as f64 / self.devices_affected as f64
    }
}

/// `online/total · 100 · (1 − errors/(requests+1))`, floored at 0.
///
/// Requests count every attempted exchange: start requests plus telemetry
/// and heartbeat sends, successful or not.
pub fn health_score(metrics: &FleetMetrics) -> f64 {
    if metrics.total_devices == 0 {
        return 0.0;
    }
    let online_ratio = metrics.online as f64 / metrics.total_devices as f64;
    let requests = metrics.total_requests + metrics.total_metrics_sent + metrics.total_messages_sent + metrics.total_errors;
    let error_ratio = metrics.total_errors as f64 / (requests + 1) as f64;
    (online_ratio * 100.0 * (1.0 - error_ratio)).max(0.0)
}

/// Suit le débit de reconnexion et découpe les fenêtres de tempête
#[derive(Debug)]
pub struct StormTracker {
    threshold: f64,
    peak: f64,
    open: Option<(ReconnectionStorm, Instant, u64)>,
    storms: Vec<ReconnectionStorm>,
    /// Total cumulé au relevé précédent : base d'une tempête qui s'ouvre
    last_total: u64,
}

impl StormTracker {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, peak: 0.0, open: None, storms: Vec::new(), last_total: 0 }
    }

    pub fn starting_at(mut self, total: u64) -> Self {
        self.last_total = total;
        self
    }

    /// `rate` in attempts per second, `total` the cumulative attempt count.
    pub fn observe(&mut self, now: Instant, rate: f64, total: u64) {
        self.peak = self.peak.max(rate);
        if rate > self.threshold {
            match &mut self.open {
                Some((storm, _, _)) => storm.peak_rate = storm.peak_rate.max(rate),
                None => {
                    warn!(reconnects_per_sec = rate, threshold = self.threshold, "reconnection storm detected");
                    let storm = ReconnectionStorm {
                        started_at: Utc::now(),
                        duration: Duration::ZERO,
                        peak_rate: rate,
                        attempts: 0,
                    };
                    self.open = Some((storm, now, self.last_total));
                }
            }
        } else {
            self.close(now, total);
        }
        self.last_total = total;
    }

    pub fn close(&mut self, now: Instant, total: u64) {
        if let Some((mut storm, opened, baseline)) = self.open.take() {
            storm.duration = now.saturating_duration_since(opened);
            storm.attempts = total.saturating_sub(baseline);
            info!(duration = ?storm.duration, peak_rate = storm.peak_rate, "reconnection storm ended");
            self.storms.push(storm);
        }
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn storms(&self) -> &[ReconnectionStorm] {
        &self.storms
    }
}

enum Recovery {
    Recovered(Duration),
    Failed,
    Cancelled,
}

/// Tout ce dont une tâche d'événement a besoin, clonable vers les tâches filles
#[derive(Clone)]
struct Disruptor {
    rng: SharedRandom,
    model: Arc<dyn RecoveryModel>,
    metrics: Arc<RwLock<NetworkResilienceMetrics>>,
    attempts: Arc<AtomicU64>,
    backoff: ReconnectBackoff,
    max_attempts: u32,
    recovery_target: Duration,
}

impl Disruptor {
    async fn run_event(self, index: usize, event: NetworkEvent, devices: Vec<Arc<VirtualDevice>>, cancel: CancellationToken) {
        if !sleep_or_cancel(&cancel, event.start_after).await {
            return;
        }

        let affected = event.affected_count(devices.len());
        info!(
            event_index = index,
            event_type = ?event.event_type,
            affected_devices = affected,
            duration = ?event.duration,
            severity = ?event.severity,
            description = %event.description,
            "starting network event"
        );
        let started_at = Utc::now();

        let mut tasks = JoinSet::new();
        for device in devices.into_iter().take(affected) {
            tasks.spawn(self.clone().disrupt_and_recover(device, event.clone(), cancel.clone()));
        }

        let (mut quick, mut slow, mut failed) = (0u64, 0u64, 0u64);
        let mut recovery_times = Vec::with_capacity(affected);
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or(Recovery::Cancelled);
            let mut m = self.metrics.write();
            match outcome {
                Recovery::Recovered(elapsed) => {
                    if elapsed <= self.recovery_target {
                        quick += 1;
                    } else {
                        slow += 1;
                    }
                    recovery_times.push(elapsed);
                    m.recovery_times.push(elapsed);
                    m.devices_recovered += 1;
                    m.successful_reconnections += 1;
                }
                Recovery::Failed => {
                    failed += 1;
                    m.devices_failed_to_recover += 1;
                    m.failed_reconnections += 1;
                }
                Recovery::Cancelled => {}
            }
        }

        let record = NetworkEventMetrics {
            event,
            started_at,
            ended_at: Utc::now(),
            devices_affected: affected,
            recovered_quickly: quick,
            recovered_slow: slow,
            failed_to_recover: failed,
            average_recovery_time: mean_duration(&recovery_times),
        };
        info!(
            event_index = index,
            event_type = ?record.event.event_type,
            devices_affected = affected,
            recovered_quickly = quick,
            recovered_slow = slow,
            failed_to_recover = failed,
            average_recovery_time = ?record.average_recovery_time,
            "network event completed"
        );

        let mut m = self.metrics.write();
        m.devices_affected += affected;
        m.network_events_executed += 1;
        m.events.push(record);
    }

    async fn disrupt_and_recover(self, device: Arc<VirtualDevice>, event: NetworkEvent, cancel: CancellationToken) -> Recovery {
        let disruption_start = Instant::now();
        let waited = match event.event_type {
            NetworkEventType::Partition => {
                device.stop().await;
                sleep_or_cancel(&cancel, event.duration).await
            }
            NetworkEventType::Intermittent => self.toggle(&device, event.duration, &cancel).await,
            NetworkEventType::Latency | NetworkEventType::PacketLoss | NetworkEventType::BandwidthLimit => {
                debug!(device_id = %device.id(), event_type = ?event.event_type, "simulating network degradation");
                sleep_or_cancel(&cancel, event.duration).await
            }
            NetworkEventType::DnsFailure => {
                debug!(device_id = %device.id(), "simulating DNS failure");
                sleep_or_cancel(&cancel, event.duration).await
            }
        };
        if !waited {
            return Recovery::Cancelled;
        }

        match self.recover(&device, event.severity, &cancel).await {
            Some(true) => {
                let elapsed = disruption_start.elapsed();
                debug!(device_id = %device.id(), recovery_time = ?elapsed, "device recovered from network event");
                Recovery::Recovered(elapsed)
            }
            Some(false) => {
                warn!(device_id = %device.id(), event_type = ?event.event_type, "device failed to recover from network event");
                Recovery::Failed
            }
            None => Recovery::Cancelled,
        }
    }

    /// Connectivité intermittente jusqu'à la fin de l'événement ; `false` si annulé.
    async fn toggle(&self, device: &VirtualDevice, duration: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if self.rng.chance(INTERMITTENT_DISCONNECT_CHANCE) {
                if device.is_started() {
                    device.stop().await;
                    debug!(device_id = %device.id(), "device disconnected (intermittent)");
                }
            } else if !device.is_started() && device.start().await.is_ok() {
                debug!(device_id = %device.id(), "device reconnected (intermittent)");
            }

            let wait = self.rng.duration_between(INTERMITTENT_MIN_WAIT, INTERMITTENT_MAX_WAIT);
            if !sleep_or_cancel(cancel, wait.min(deadline - now)).await {
                return false;
            }
        }
    }

    /// `Some(recovered)`, ou `None` si la reconnexion a été interrompue.
    async fn recover(&self, device: &VirtualDevice, severity: Severity, cancel: &CancellationToken) -> Option<bool> {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return None;
            }
            self.attempts.fetch_add(1, Ordering::Relaxed);
            debug!(device_id = %device.id(), attempt, max_attempts = self.max_attempts, "attempting device reconnection");

            let probability = self.model.attempt_probability(device.profile(), severity, attempt);
            if self.rng.chance(probability) {
                if device.is_started() {
                    return Some(true);
                }
                match device.start().await {
                    Ok(()) | Err(DeviceError::AlreadyStarted(_)) => return Some(true),
                    Err(DeviceError::Cancelled) => return None,
                }
            }

            if attempt < self.max_attempts && !sleep_or_cancel(cancel, self.backoff.delay(attempt)).await {
                return None;
            }
        }
        Some(false)
    }
}

pub struct NetworkResilienceScenario {
    config: NetworkResilienceConfig,
    rng: SharedRandom,
    model: Arc<dyn RecoveryModel>,
    metrics: Arc<RwLock<NetworkResilienceMetrics>>,
    attempts: Arc<AtomicU64>,
}

impl NetworkResilienceScenario {
    pub fn new(config: NetworkResilienceConfig) -> Self {
        Self {
            config,
            rng: thread_random(),
            model: Arc::new(ProfileRecoveryModel),
            metrics: Arc::new(RwLock::new(NetworkResilienceMetrics::default())),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn RecoveryModel>) -> Self {
        self.model = model;
        self
    }

    pub fn config(&self) -> &NetworkResilienceConfig {
        &self.config
    }

    pub fn metrics(&self) -> NetworkResilienceMetrics {
        let mut snapshot = self.metrics.read().clone();
        snapshot.reconnection_attempts = self.attempts.load(Ordering::Relaxed);
        snapshot
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ScenarioError> {
        self.config.validate()?;
        let started = Instant::now();
        self.attempts.store(0, Ordering::Relaxed);
        *self.metrics.write() = NetworkResilienceMetrics {
            started_at: Some(Utc::now()),
            total_devices: self.config.fleet.total_devices,
            ..Default::default()
        };

        info!(
            scenario = "network_resilience",
            total_devices = self.config.fleet.total_devices,
            test_duration = ?self.config.test_duration,
            network_events = self.config.events.len(),
            recovery_target = ?self.config.recovery_target,
            "starting network resilience scenario"
        );

        let fleet = self.config.fleet.build(cancel, self.rng.clone(), self.config.test_duration);
        guarded(&fleet, async {
            start_fleet(&fleet, started).await?;
            info!("waiting for fleet stabilization");
            pause(cancel, self.config.settle_time, started).await?;

            let monitor_cancel = cancel.child_token();
            let (outcome, storms, ()) = tokio::join!(
                async {
                    let outcome = self.run_events(fleet.list_devices(), cancel, started).await;
                    monitor_cancel.cancel();
                    outcome
                },
                self.watch_storms(&monitor_cancel),
                self.monitor_health(&fleet, &monitor_cancel),
            );

            self.record_health(&fleet.refresh_metrics());
            self.finalize(storms);
            outcome?;
            self.analyze()
        })
        .await
    }

    async fn run_events(
        &self,
        devices: Vec<Arc<VirtualDevice>>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), ScenarioError> {
        let disruptor = Disruptor {
            rng: self.rng.clone(),
            model: self.model.clone(),
            metrics: self.metrics.clone(),
            attempts: self.attempts.clone(),
            backoff: self.config.backoff,
            max_attempts: self.config.max_reconnect_attempts,
            recovery_target: self.config.recovery_target,
        };

        let mut tasks = JoinSet::new();
        for (index, event) in self.config.events.iter().enumerate() {
            tasks.spawn(disruptor.clone().run_event(index, event.clone(), devices.clone(), cancel.clone()));
        }

        pause(cancel, self.config.test_duration, started).await?;
        info!("network resilience test window completed, waiting for outstanding events");
        while tasks.join_next().await.is_some() {}

        if cancel.is_cancelled() {
            return Err(ScenarioError::Cancelled(started.elapsed()));
        }
        Ok(())
    }

    async fn watch_storms(&self, cancel: &CancellationToken) -> StormTracker {
        let period = self.config.storm_check_interval.max(Duration::from_millis(1));
        let initial = self.attempts.load(Ordering::Relaxed);
        let mut tracker = StormTracker::new(self.config.storm_threshold).starting_at(initial);
        let mut sampler = RateSampler::new();
        sampler.sample(Instant::now(), initial);

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let total = self.attempts.load(Ordering::Relaxed);
            if let Some(rate) = sampler.sample(now, total) {
                tracker.observe(now, rate, total);
            }
        }
        tracker.close(Instant::now(), self.attempts.load(Ordering::Relaxed));
        tracker
    }

    async fn monitor_health(&self, fleet: &FleetSimulator, cancel: &CancellationToken) {
        let period = self.config.health_check_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.record_health(&fleet.metrics()),
            }
        }
    }

    fn record_health(&self, fleet_metrics: &FleetMetrics) {
        self.metrics.write().network_health_score = health_score(fleet_metrics);
    }

    fn finalize(&self, storms: StormTracker) {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let mut m = self.metrics.write();
        m.ended_at = Some(Utc::now());
        m.reconnection_attempts = attempts;
        m.peak_reconnect_rate = storms.peak();
        m.storms = storms.storms().to_vec();
        m.average_recovery_time = mean_duration(&m.recovery_times);
        m.p95_recovery_time = percentile(&m.recovery_times, 0.95);
        m.p99_recovery_time = percentile(&m.recovery_times, 0.99);

        info!(
            total_devices = m.total_devices,
            devices_affected = m.devices_affected,
            devices_recovered = m.devices_recovered,
            devices_failed_to_recover = m.devices_failed_to_recover,
            network_events_executed = m.network_events_executed,
            reconnection_attempts = m.reconnection_attempts,
            average_recovery_time = ?m.average_recovery_time,
            p95_recovery_time = ?m.p95_recovery_time,
            p99_recovery_time = ?m.p99_recovery_time,
            peak_reconnect_rate = m.peak_reconnect_rate,
            storms = m.storms.len(),
            network_health_score = m.network_health_score,
            "network resilience scenario results"
        );
    }

    fn analyze(&self) -> Result<(), ScenarioError> {
        let m = self.metrics.read();
        let target = self.config.recovery_target;
        let mut violations = Violations::new();

        violations.check(m.devices_affected > 0 && m.recovery_rate() < MIN_RECOVERY_RATE, || {
            format!("recovery rate {} below threshold {}", percent(m.recovery_rate()), percent(MIN_RECOVERY_RATE))
        });
        violations.check(m.p95_recovery_time > target * 2, || {
            format!("P95 recovery time {:?} exceeds 2x target time {:?}", m.p95_recovery_time, target)
        });
        violations.check(m.network_health_score < MIN_HEALTH_SCORE, || {
            format!("network health score {:.1} below threshold {MIN_HEALTH_SCORE}", m.network_health_score)
        });

        if violations.is_empty() {
            info!("network resilience scenario PASSED");
        }
        violations.into_result()
    }
}

impl Scenario for NetworkResilienceScenario {
    fn name(&self) -> &'static str {
        "network_resilience"
    }

    fn description(&self) -> &'static str {
        "Simulates network issues and tests device reconnection capabilities and system resilience"
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
