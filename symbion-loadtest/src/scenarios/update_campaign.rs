/**
 * UPDATE CAMPAIGN - Déploiement progressif d'une mise à jour sur la flotte
 *
 * RÔLE : Met à jour un canary, puis le reste de la flotte par lots, avec
 * retour arrière si le taux d'échec du déploiement dépasse le seuil.
 *
 * FONCTIONNEMENT : Machine d'état Canary -> Rollout -> Completed, avec les
 * sorties Failed (canary sous le seuil) et RolledBack (échecs du rollout).
 * Le succès et la durée de chaque mise à jour viennent d'un `UpdateModel`.
 *
 * UTILITÉ : Valide la tenue du backend pendant une campagne de mises à jour.
 */

use super::common::{guarded, pause, percent, start_fleet};
use super::stats::mean_duration;
use super::{Scenario, ScenarioFleet, ScenarioReport};
use crate::device::{DeviceProfile, DeviceStatus, VirtualDevice};
use crate::error::ScenarioError;
use crate::random::{thread_random, RandomSource, SharedRandom};
use crate::timing::sleep_or_cancel;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DURATION_JITTER: f64 = 0.3;
const ROLLBACK_SPEEDUP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    Canary,
    Rollout,
    Completed,
    RolledBack,
    Failed,
}

/// Outcome model of a single device update
pub trait UpdateModel: Send + Sync {
    fn success_probability(&self, profile: DeviceProfile) -> f64;
    fn duration(&self, profile: DeviceProfile) -> Duration;
}

/// Full devices update more reliably and faster than minimal ones
#[derive(Debug, Clone, Copy)]
pub struct ProfileUpdateModel {
    pub success_rate: f64,
    pub update_duration: Duration,
}

impl UpdateModel for ProfileUpdateModel {
    fn success_probability(&self, profile: DeviceProfile) -> f64 {
        match profile {
            DeviceProfile::Full => self.success_rate + 0.02,
            DeviceProfile::Constrained => self.success_rate,
            DeviceProfile::Minimal => self.success_rate - 0.05,
        }
    }

    fn duration(&self, profile: DeviceProfile) -> Duration {
        match profile {
            DeviceProfile::Full => self.update_duration,
            DeviceProfile::Constrained => self.update_duration.mul_f64(1.2),
            DeviceProfile::Minimal => self.update_duration.mul_f64(1.5),
        }
    }
}

/// Même probabilité et même durée pour tous les profils
#[derive(Debug, Clone, Copy)]
pub struct FixedUpdateModel {
    pub probability: f64,
    pub duration: Duration,
}

impl UpdateModel for FixedUpdateModel {
    fn success_probability(&self, _profile: DeviceProfile) -> f64 {
        self.probability
    }

    fn duration(&self, _profile: DeviceProfile) -> Duration {
        self.duration
    }
}

#[derive(Debug, Clone)]
pub struct UpdateCampaignConfig {
    pub fleet: ScenarioFleet,
    pub test_duration: Duration,
    pub update_batch_size: usize,
    pub update_batch_interval: Duration,
    pub update_success_rate: f64,
    pub update_duration: Duration,
    /// Taux d'échec du rollout déclenchant le retour arrière
    pub rollback_threshold: f64,
    pub canary_percentage: f64,
    pub settle_time: Duration,
    pub progress_interval: Duration,
}

impl Default for UpdateCampaignConfig {
    fn default() -> Self {
        Self {
            fleet: ScenarioFleet::new([0.3, 0.5, 0.2], 100, Duration::from_secs(1), 500),
            test_duration: Duration::from_secs(30 * 60),
            update_batch_size: 50,
            update_batch_interval: Duration::from_secs(2 * 60),
            update_success_rate: 0.95,
            update_duration: Duration::from_secs(5 * 60),
            rollback_threshold: 0.1,
            canary_percentage: 0.05,
            settle_time: Duration::from_secs(30),
            progress_interval: Duration::from_secs(10),
        }
    }
}

impl UpdateCampaignConfig {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.fleet.validate()?;
        if self.update_batch_size == 0 {
            return Err(ScenarioError::Config("update_batch_size must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.update_success_rate) {
            return Err(ScenarioError::Config("update_success_rate must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.canary_percentage) {
            return Err(ScenarioError::Config("canary_percentage must be within [0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateBatchMetrics {
    pub batch_number: usize,
    pub device_count: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCampaignMetrics {
    pub phase: CampaignPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_devices: usize,
    pub devices_updating: usize,
    pub devices_updated: u64,
    pub devices_failed: u64,
    pub devices_rolled_back: u64,
    pub updates_initiated: u64,
    pub updates_completed: u64,
    pub update_failures: u64,
    pub rollout_updates: u64,
    pub rollout_failures: u64,
    pub canary_success_rate: f64,
    pub overall_success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub average_update_duration: Duration,
    #[serde(skip)]
    pub update_durations: Vec<Duration>,
    pub batches: Vec<UpdateBatchMetrics>,
    pub rollback_triggered: bool,
}

impl Default for UpdateCampaignMetrics {
    fn default() -> Self {
        Self {
            phase: CampaignPhase::Canary,
            started_at: None,
            ended_at: None,
            total_devices: 0,
            devices_updating: 0,
            devices_updated: 0,
            devices_failed: 0,
            devices_rolled_back: 0,
            updates_initiated: 0,
            updates_completed: 0,
            update_failures: 0,
            rollout_updates: 0,
            rollout_failures: 0,
            canary_success_rate: 0.0,
            overall_success_rate: 0.0,
            average_update_duration: Duration::ZERO,
            update_durations: Vec::new(),
            batches: Vec::new(),
            rollback_triggered: false,
        }
    }
}

impl UpdateCampaignMetrics {
    fn rollout_failure_rate(&self) -> f64 {
        if self.rollout_updates == 0 {
            return 0.0;
        }
        self.rollout_failures as f64 / self.rollout_updates as f64
    }
}

pub struct UpdateCampaignScenario {
    config: UpdateCampaignConfig,
    rng: SharedRandom,
    model: Arc<dyn UpdateModel>,
    metrics: RwLock<UpdateCampaignMetrics>,
}

impl UpdateCampaignScenario {
    pub fn new(config: UpdateCampaignConfig) -> Self {
        let model = ProfileUpdateModel {
            success_rate: config.update_success_rate,
            update_duration: config.update_duration,
        };
        Self {
            config,
            rng: thread_random(),
            model: Arc::new(model),
            metrics: RwLock::new(UpdateCampaignMetrics::default()),
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn UpdateModel>) -> Self {
        self.model = model;
        self
    }

    pub fn config(&self) -> &UpdateCampaignConfig {
        &self.config
    }

    pub fn metrics(&self) -> UpdateCampaignMetrics {
        self.metrics.read().clone()
    }

    pub fn phase(&self) -> CampaignPhase {
        self.metrics.read().phase
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ScenarioError> {
        self.config.validate()?;
        let started = Instant::now();
        *self.metrics.write() = UpdateCampaignMetrics { started_at: Some(Utc::now()), ..Default::default() };

        info!(
            scenario = "update_campaign",
            total_devices = self.config.fleet.total_devices,
            batch_size = self.config.update_batch_size,
            canary_percentage = self.config.canary_percentage,
            expected_success_rate = self.config.update_success_rate,
            "starting update campaign scenario"
        );

        let fleet = self.config.fleet.build(cancel, self.rng.clone(), self.config.test_duration);
        guarded(&fleet, async {
            start_fleet(&fleet, started).await?;
            info!("waiting for devices to settle");
            pause(cancel, self.config.settle_time, started).await?;

            let progress_cancel = cancel.child_token();
            let (outcome, ()) = tokio::join!(
                async {
                    let outcome = self.run_campaign(fleet.list_devices(), cancel, started).await;
                    progress_cancel.cancel();
                    outcome
                },
                self.log_progress(&progress_cancel),
            );

            self.finalize();
            outcome?;
            self.analyze()
        })
        .await
    }

    async fn run_campaign(
        &self,
        devices: Vec<Arc<VirtualDevice>>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), ScenarioError> {
        let total = devices.len();
        self.metrics.write().total_devices = total;
        if total == 0 {
            self.set_phase(CampaignPhase::Completed);
            return Ok(());
        }

        // Phase 1 : canary
        let canary_count = (((total as f64) * self.config.canary_percentage).floor() as usize).clamp(1, total);
        self.set_phase(CampaignPhase::Canary);
        info!(devices = canary_count, "starting canary deployment");

        let (ok, failed) = self.update_devices(&devices[..canary_count], cancel, false).await;
        if cancel.is_cancelled() {
            return Err(ScenarioError::Cancelled(started.elapsed()));
        }
        let canary_rate = ok as f64 / (ok + failed).max(1) as f64;
        self.metrics.write().canary_success_rate = canary_rate;
        info!(success_count = ok, failure_count = failed, success_rate = canary_rate, "canary phase completed");

        if canary_rate < self.config.update_success_rate {
            error!(success_rate = canary_rate, threshold = self.config.update_success_rate, "canary deployment below threshold");
            self.set_phase(CampaignPhase::Failed);
            return Err(ScenarioError::CanaryFailed {
                success_rate: canary_rate,
                threshold: self.config.update_success_rate,
            });
        }

        // Phase 2 : rollout par lots
        let remaining = &devices[canary_count..];
        if !remaining.is_empty() {
            self.set_phase(CampaignPhase::Rollout);
            info!(devices = remaining.len(), "starting full rollout");

            let batch_count = remaining.len().div_ceil(self.config.update_batch_size);
            for (index, batch) in remaining.chunks(self.config.update_batch_size).enumerate() {
                if cancel.is_cancelled() {
                    return Err(ScenarioError::Cancelled(started.elapsed()));
                }
                self.run_batch(index + 1, batch, cancel).await;
                if cancel.is_cancelled() {
                    return Err(ScenarioError::Cancelled(started.elapsed()));
                }

                let failure_rate = self.metrics.read().rollout_failure_rate();
                if failure_rate > self.config.rollback_threshold {
                    warn!(failure_rate, threshold = self.config.rollback_threshold, "rollback triggered");
                    {
                        let mut m = self.metrics.write();
                        m.rollback_triggered = true;
                        m.phase = CampaignPhase::RolledBack;
                    }
                    self.rollback(&devices, cancel).await;
                    return Err(ScenarioError::RolledBack {
                        failure_rate,
                        threshold: self.config.rollback_threshold,
                    });
                }

                if index + 1 < batch_count {
                    pause(cancel, self.config.update_batch_interval, started).await?;
                }
            }
        }

        self.set_phase(CampaignPhase::Completed);
        info!("update campaign completed");
        Ok(())
    }

    async fn run_batch(&self, batch_number: usize, batch: &[Arc<VirtualDevice>], cancel: &CancellationToken) {
        let batch_start = Instant::now();
        info!(batch_number, device_count = batch.len(), "executing update batch");

        let (ok, failed) = self.update_devices(batch, cancel, true).await;
        let record = UpdateBatchMetrics {
            batch_number,
            device_count: batch.len(),
            success_count: ok,
            failure_count: failed,
            success_rate: if batch.is_empty() { 0.0 } else { ok as f64 / batch.len() as f64 },
            duration: batch_start.elapsed(),
        };
        info!(
            batch_number,
            success_count = ok,
            failure_count = failed,
            success_rate = record.success_rate,
            duration = ?record.duration,
            "batch completed"
        );
        self.metrics.write().batches.push(record);
    }

    /// Une tâche par device ; les compteurs sont mis à jour à chaque fin de tâche.
    async fn update_devices(&self, devices: &[Arc<VirtualDevice>], cancel: &CancellationToken, rollout: bool) -> (u64, u64) {
        self.metrics.write().devices_updating += devices.len();

        let mut tasks = JoinSet::new();
        for device in devices {
            tasks.spawn(update_device(device.clone(), self.model.clone(), self.rng.clone(), cancel.clone()));
        }

        let (mut ok, mut failed) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            let (success, elapsed) = joined.unwrap_or((false, Duration::ZERO));
            let mut m = self.metrics.write();
            m.devices_updating = m.devices_updating.saturating_sub(1);
            m.update_durations.push(elapsed);
            m.updates_initiated += 1;
            if rollout {
                m.rollout_updates += 1;
            }
            if success {
                ok += 1;
                m.updates_completed += 1;
                m.devices_updated += 1;
            } else {
                failed += 1;
                m.update_failures += 1;
                m.devices_failed += 1;
                if rollout {
                    m.rollout_failures += 1;
                }
            }
        }
        (ok, failed)
    }

    async fn rollback(&self, devices: &[Arc<VirtualDevice>], cancel: &CancellationToken) {
        let duration = self.config.update_duration / ROLLBACK_SPEEDUP;
        info!(devices = devices.len(), ?duration, "executing rollback");

        let mut tasks = JoinSet::new();
        for device in devices {
            let device = device.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if !sleep_or_cancel(&cancel, duration).await {
                    return false;
                }
                debug!(device_id = %device.id(), "device rolled back");
                true
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                self.metrics.write().devices_rolled_back += 1;
            }
        }
        info!(devices_rolled_back = self.metrics.read().devices_rolled_back, "rollback completed");
    }

    async fn log_progress(&self, cancel: &CancellationToken) {
        let period = self.config.progress_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let m = self.metrics.read().clone();
            let current = if m.updates_initiated == 0 { 0.0 } else { m.updates_completed as f64 / m.updates_initiated as f64 };
            info!(
                phase = ?m.phase,
                updates_initiated = m.updates_initiated,
                updates_completed = m.updates_completed,
                update_failures = m.update_failures,
                current_success_rate = current,
                devices_updating = m.devices_updating,
                "campaign progress"
            );
        }
    }

    fn set_phase(&self, phase: CampaignPhase) {
        self.metrics.write().phase = phase;
    }

    fn finalize(&self) {
        let mut m = self.metrics.write();
        m.ended_at = Some(Utc::now());
        if m.updates_initiated > 0 {
            m.overall_success_rate = m.updates_completed as f64 / m.updates_initiated as f64;
        }
        m.average_update_duration = mean_duration(&m.update_durations);

        info!(
            phase = ?m.phase,
            total_devices = m.total_devices,
            devices_updated = m.devices_updated,
            devices_failed = m.devices_failed,
            devices_rolled_back = m.devices_rolled_back,
            overall_success_rate = m.overall_success_rate,
            average_update_duration = ?m.average_update_duration,
            rollback_triggered = m.rollback_triggered,
            "update campaign results"
        );
        if !m.batches.is_empty() {
            let rates: Vec<f64> = m.batches.iter().map(|b| b.success_rate).collect();
            let min = rates.iter().copied().fold(1.0, f64::min);
            let max = rates.iter().copied().fold(0.0, f64::max);
            info!(total_batches = rates.len(), avg_success_rate = super::stats::mean(&rates), min, max, "batch performance summary");
        }
    }

    fn analyze(&self) -> Result<(), ScenarioError> {
        let m = self.metrics.read();
        match m.phase {
            CampaignPhase::Completed if m.overall_success_rate >= self.config.update_success_rate => {
                info!("update campaign scenario PASSED");
                Ok(())
            }
            CampaignPhase::Completed => Err(ScenarioError::ThresholdViolations(vec![format!(
                "overall success rate {} below threshold {}",
                percent(m.overall_success_rate),
                percent(self.config.update_success_rate)
            )])),
            phase => Err(ScenarioError::ThresholdViolations(vec![format!(
                "update campaign did not complete (phase {phase:?})"
            )])),
        }
    }
}

async fn update_device(
    device: Arc<VirtualDevice>,
    model: Arc<dyn UpdateModel>,
    rng: SharedRandom,
    cancel: CancellationToken,
) -> (bool, Duration) {
    let profile = device.profile();
    let base = model.duration(profile);
    let duration = base + base.mul_f64(DURATION_JITTER * rng.next_f64());

    let marked = device.set_status(DeviceStatus::Updating);
    let started = Instant::now();
    let completed = sleep_or_cancel(&cancel, duration).await;
    if marked {
        device.transition_from(DeviceStatus::Updating, DeviceStatus::Online);
    }
    if !completed {
        return (false, started.elapsed());
    }

    let success = rng.chance(model.success_probability(profile));
    debug!(device_id = %device.id(), success, "device update finished");
    (success, started.elapsed())
}

impl Scenario for UpdateCampaignScenario {
    fn name(&self) -> &'static str {
        "update_campaign"
    }

    fn description(&self) -> &'static str {
        "Simulates a fleet-wide update deployment with canary testing and rollback capabilities"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::DeviceTiming;
    use crate::random::FixedRandom;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(devices: usize) -> UpdateCampaignConfig {
        let timing = DeviceTiming::new(Duration::from_secs(5), Duration::from_secs(10))
            .with_checks(Duration::from_secs(3600), Duration::from_secs(3600));
        UpdateCampaignConfig {
            fleet: ScenarioFleet::new([1.0, 0.0, 0.0], 50, Duration::from_millis(10), 50)
                .with_devices(devices)
                .with_timing(timing),
            update_batch_size: 10,
            update_batch_interval: Duration::from_secs(1),
            update_duration: Duration::from_secs(10),
            settle_time: Duration::from_secs(1),
            progress_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn scenario(devices: usize, probability: f64) -> UpdateCampaignScenario {
        UpdateCampaignScenario::new(fast_config(devices))
            .with_random(Arc::new(FixedRandom::new(0.99)))
            .with_model(Arc::new(FixedUpdateModel { probability, duration: Duration::from_secs(10) }))
    }

    #[test]
    fn test_profile_model() {
        let model = ProfileUpdateModel { success_rate: 0.9, update_duration: Duration::from_secs(100) };
        assert!((model.success_probability(DeviceProfile::Full) - 0.92).abs() < 1e-9);
        assert!((model.success_probability(DeviceProfile::Minimal) - 0.85).abs() < 1e-9);
        assert_eq!(model.duration(DeviceProfile::Constrained), Duration::from_secs(120));
        assert_eq!(model.duration(DeviceProfile::Minimal), Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_completes() {
        let scenario = scenario(40, 1.0);
        scenario.execute(&CancellationToken::new()).await.unwrap();

        let m = scenario.metrics();
        assert_eq!(m.phase, CampaignPhase::Completed);
        assert_eq!(m.devices_updated, 40);
        assert_eq!(m.devices_failed, 0);
        assert_eq!(m.canary_success_rate, 1.0);
        // canary de 2 devices, puis 38 en lots de 10
        assert_eq!(m.batches.len(), 4);
        assert_eq!(m.batches.last().unwrap().device_count, 8);
        assert_eq!(m.overall_success_rate, 1.0);
        assert!(m.average_update_duration >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canary_failure_leaves_rest_untouched() {
        let scenario = scenario(40, 0.0);
        let err = scenario.execute(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScenarioError::CanaryFailed { .. }));

        let m = scenario.metrics();
        assert_eq!(m.phase, CampaignPhase::Failed);
        assert_eq!(m.updates_initiated, 2);
        assert!(m.batches.is_empty());
    }

    /// Les `succeed_first` premières mises à jour réussissent, les suivantes échouent.
    struct FailAfter {
        succeed_first: usize,
        calls: AtomicUsize,
    }

    impl UpdateModel for FailAfter {
        fn success_probability(&self, _profile: DeviceProfile) -> f64 {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.succeed_first {
                1.0
            } else {
                0.0
            }
        }

        fn duration(&self, _profile: DeviceProfile) -> Duration {
            Duration::from_secs(10)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_failures_trigger_rollback() {
        let model = Arc::new(FailAfter { succeed_first: 2, calls: AtomicUsize::new(0) });
        let scenario = UpdateCampaignScenario::new(fast_config(40))
            .with_random(Arc::new(FixedRandom::new(0.99)))
            .with_model(model);

        let err = scenario.execute(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ScenarioError::RolledBack { .. }), "{err}");

        let m = scenario.metrics();
        assert_eq!(m.phase, CampaignPhase::RolledBack);
        assert!(m.rollback_triggered);
        assert_eq!(m.canary_success_rate, 1.0);
        assert_eq!(m.batches.len(), 1);
        assert_eq!(m.rollout_failures, 10);
        assert_eq!(m.devices_rolled_back, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_campaign() {
        let scenario = scenario(20, 1.0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let err = scenario.execute(&cancel).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Cancelled(_)));
        assert_ne!(scenario.phase(), CampaignPhase::Completed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = fast_config(10);
        config.update_batch_size = 0;
        assert!(matches!(config.validate(), Err(ScenarioError::Config(_))));
        config.update_batch_size = 5;
        config.fleet = config.fleet.with_distribution(BTreeMap::new());
        assert!(config.validate().is_ok());
    }
}
