/*!
Test Harness pour scénarios Symbion

Facilite l'écriture de tests du banc de charge avec:
- Intervalles de devices courts (télémétrie 5s, heartbeat 10s, pas de fautes)
- Aléa fixe à 0.99 : aucune erreur injectée, aucun changement d'état spontané
- Configurations de scénarios prêtes pour le temps virtuel de tokio
*/

use crate::event_recorder::EventRecorder;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use symbion_loadtest::scenarios::network_resilience::{NetworkEvent, NetworkEventType, Severity};
use symbion_loadtest::scenarios::{
    NetworkResilienceConfig, OnboardingStormConfig, ScenarioFleet, UpdateCampaignConfig,
};
use symbion_loadtest::{
    DeviceProfile, DeviceTiming, FixedRandom, FleetConfig, FleetMetrics, FleetSimulator, SharedRandom,
};
use tokio_util::sync::CancellationToken;

/// Valeur tirée par défaut : au-dessus de toutes les probabilités de panne
pub const QUIET_DRAW: f64 = 0.99;

pub type HarnessResult = Result<()>;

/// Harness de test pour flottes et scénarios
#[derive(Clone)]
pub struct FleetHarness {
    timing: DeviceTiming,
    rng: SharedRandom,
    server_url: String,
    cancel: CancellationToken,
}

impl FleetHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            timing: DeviceTiming::new(Duration::from_secs(5), Duration::from_secs(10))
                .with_checks(Duration::from_secs(3600), Duration::from_secs(3600)),
            rng: Arc::new(FixedRandom::new(QUIET_DRAW)),
            server_url: "http://localhost:8080".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_timing(mut self, timing: DeviceTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> DeviceTiming {
        self.timing
    }

    pub fn random(&self) -> SharedRandom {
        self.rng.clone()
    }

    /// Jeton racine ; l'annuler arrête toutes les flottes du harness.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Flotte homogène de devices `full`.
    pub fn fleet(&self, devices: usize, batch_size: usize) -> FleetSimulator {
        self.fleet_with(BTreeMap::from([(DeviceProfile::Full, devices)]), batch_size)
    }

    pub fn fleet_with(&self, profiles: BTreeMap<DeviceProfile, usize>, batch_size: usize) -> FleetSimulator {
        let mut config = FleetConfig::with_profiles(profiles)
            .with_batches(batch_size, Duration::from_millis(100), batch_size)
            .with_timing(self.timing);
        config.server_url = self.server_url.clone();
        FleetSimulator::new(config)
            .with_random(self.rng.clone())
            .with_parent(&self.cancel)
    }

    /// Démarre la flotte et renvoie les métriques juste après le dernier lot.
    pub async fn start(&self, fleet: &FleetSimulator) -> Result<FleetMetrics> {
        fleet.start().await.context("fleet failed to start")?;
        let metrics = fleet.metrics();
        log::info!(
            "🚀 Fleet started: {}/{} online in {} batches",
            metrics.online,
            metrics.total_devices,
            fleet.batch_log().len()
        );
        Ok(metrics)
    }

    /// Arrête la flotte et récupère tout le flux d'événements.
    pub async fn stop_and_record(&self, fleet: &FleetSimulator) -> Result<EventRecorder> {
        let receiver = fleet.take_events().context("event stream already taken")?;
        fleet.stop().await;
        let mut recorder = EventRecorder::new();
        let drained = recorder.drain_until_closed(receiver).await;
        log::info!("📦 Recorded {} fleet events", drained);
        Ok(recorder)
    }

    /// Paramètres de flotte d'un scénario, intervalles courts inclus.
    pub fn scenario_fleet(&self, distribution: [f64; 3], devices: usize) -> ScenarioFleet {
        ScenarioFleet::new(distribution, 100, Duration::from_millis(10), 100)
            .with_devices(devices)
            .with_server(self.server_url.clone(), false, None)
            .with_timing(self.timing)
    }

    pub fn update_campaign_config(&self, devices: usize) -> UpdateCampaignConfig {
        UpdateCampaignConfig {
            fleet: self.scenario_fleet([1.0, 0.0, 0.0], devices),
            update_batch_size: 10,
            update_batch_interval: Duration::from_secs(1),
            update_duration: Duration::from_secs(10),
            settle_time: Duration::from_secs(1),
            progress_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Une seule partition, 5s après stabilisation, pendant 10s.
    pub fn partition_config(&self, devices: usize, fraction: f64) -> NetworkResilienceConfig {
        NetworkResilienceConfig {
            fleet: self.scenario_fleet([1.0, 0.0, 0.0], devices),
            test_duration: Duration::from_secs(60),
            events: vec![NetworkEvent::new(
                NetworkEventType::Partition,
                Duration::from_secs(5),
                Duration::from_secs(10),
                fraction,
                Severity::High,
                "partition",
            )],
            settle_time: Duration::from_secs(1),
            ..Default::default()
        }
    }

    pub fn onboarding_storm_config(&self, devices: usize, burst_size: usize) -> OnboardingStormConfig {
        OnboardingStormConfig {
            fleet: self.scenario_fleet([0.2, 0.5, 0.3], devices),
            test_duration: Duration::from_secs(5),
            burst_size,
            burst_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }
}

impl Default for FleetHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Macro pour créer un test de scénario en temps virtuel
#[macro_export]
macro_rules! scenario_test {
    ($name:ident, |$harness:ident| $body:block) => {
        #[tokio::test(start_paused = true)]
        async fn $name() {
            async fn body($harness: &$crate::test_utils::FleetHarness) -> $crate::test_utils::HarnessResult $body

            let harness = $crate::test_utils::FleetHarness::new();
            match body(&harness).await {
                Ok(()) => println!("✅ Test '{}' passed", stringify!($name)),
                Err(e) => panic!("Test '{}' failed: {:#}", stringify!($name), e),
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use symbion_loadtest::scenarios::network_resilience::RecoveryModel;
    use symbion_loadtest::scenarios::update_campaign::{CampaignPhase, FixedUpdateModel};
    use symbion_loadtest::scenarios::{NetworkResilienceScenario, OnboardingStormScenario, UpdateCampaignScenario};
    use symbion_loadtest::{DeviceStatus, EventType};

    /// Échec forcé sur les 4 premières tentatives, succès à la 5e
    struct FifthAttemptRecovers;

    impl RecoveryModel for FifthAttemptRecovers {
        fn attempt_probability(&self, _profile: DeviceProfile, _severity: Severity, attempt: u32) -> f64 {
            if attempt >= 5 {
                1.0
            } else {
                0.0
            }
        }
    }

    scenario_test!(test_fleet_starts_in_three_batches, |harness| {
        let fleet = harness.fleet(25, 10);
        let metrics = harness.start(&fleet).await?;
        assert_eq!(metrics.online, 25);
        assert_eq!(metrics.failed_requests, 0);

        let batches = fleet.batch_log();
        let sizes: Vec<_> = batches.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        for pair in batches.windows(2) {
            assert!(pair[1].started_at >= pair[0].completed_at);
        }

        let recorder = harness.stop_and_record(&fleet).await?;
        recorder.assert_count(EventType::BatchCompleted, 3)?;
        recorder.assert_count(EventType::DeviceStarted, 25)?;
        recorder.assert_count(EventType::DeviceRegistered, 25)?;
        recorder.assert_count(EventType::MetricsSent, 0)?;
        recorder.assert_count(EventType::DeviceStopped, 25)?;
        assert_eq!(recorder.batch_sizes(), vec![10, 10, 5]);

        fleet.stop().await;
        assert_eq!(fleet.metrics().offline, 25);
        Ok(())
    });

    scenario_test!(test_update_campaign_reaches_completed, |harness| {
        let scenario = UpdateCampaignScenario::new(harness.update_campaign_config(100))
            .with_random(harness.random())
            .with_model(Arc::new(FixedUpdateModel { probability: 1.0, duration: Duration::from_secs(10) }));
        scenario.execute(harness.cancel_token()).await?;

        let m = scenario.metrics();
        assert_eq!(m.phase, CampaignPhase::Completed);
        assert_eq!(m.devices_updated, 100);
        assert_eq!(m.devices_failed, 0);
        assert!(!m.rollback_triggered);
        Ok(())
    });

    scenario_test!(test_partitioned_devices_all_recover, |harness| {
        let mut config = harness.partition_config(50, 0.2);
        config.max_reconnect_attempts = 5;
        let scenario = NetworkResilienceScenario::new(config)
            .with_random(harness.random())
            .with_model(Arc::new(FifthAttemptRecovers));
        scenario.execute(harness.cancel_token()).await?;

        let m = scenario.metrics();
        assert_eq!(m.devices_affected, 10);
        assert_eq!(m.devices_recovered, 10);
        assert_eq!(m.devices_failed_to_recover, 0);
        // mesuré avant l'arrêt de la flotte : les 50 devices sont en ligne
        assert!(m.network_health_score >= 99.0);
        Ok(())
    });

    scenario_test!(test_onboarding_storm_passes, |harness| {
        let scenario = OnboardingStormScenario::new(harness.onboarding_storm_config(30, 10))
            .with_random(harness.random());
        scenario.execute(harness.cancel_token()).await?;

        let m = scenario.metrics();
        assert_eq!(m.devices_successful, 30);
        assert_eq!(m.batches_completed, 3);
        Ok(())
    });

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_harness_stops_fleet() {
        let harness = FleetHarness::new();
        let fleet = harness.fleet(5, 5);
        harness.start(&fleet).await.unwrap();
        let device = fleet.list_devices()[0].clone();
        assert_eq!(device.status(), DeviceStatus::Online);

        harness.cancel_token().cancel();
        fleet.stop().await;
        assert_eq!(device.status(), DeviceStatus::Offline);
        assert!(!device.is_started());
    }
}
