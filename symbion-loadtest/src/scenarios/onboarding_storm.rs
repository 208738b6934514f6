//! Onboarding storm: the whole fleet registers in bursts
//!
//! - Fleet start batches are the bursts (`burst_size` every `burst_interval`)
//! - Start latency is the duration of the full batched start
//! - The event stream and fleet metrics are watched for the observation window

use super::common::{guarded, pause, percent, start_fleet, Violations};
use super::stats::percentile;
use super::{Scenario, ScenarioFleet, ScenarioReport};
use crate::error::ScenarioError;
use crate::fleet::{Event, EventType, FleetMetrics, FleetSimulator};
use crate::random::{thread_random, SharedRandom};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OnboardingStormConfig {
    pub fleet: ScenarioFleet,
    /// Observation window once the fleet is started
    pub test_duration: Duration,
    pub burst_size: usize,
    pub burst_interval: Duration,
    pub concurrency_limit: usize,
    pub success_threshold: f64,
    pub latency_threshold: Duration,
    pub monitor_interval: Duration,
}

impl Default for OnboardingStormConfig {
    fn default() -> Self {
        Self {
            fleet: ScenarioFleet::new([0.2, 0.5, 0.3], 50, Duration::from_secs(2), 100),
            test_duration: Duration::from_secs(5 * 60),
            burst_size: 50,
            burst_interval: Duration::from_secs(2),
            concurrency_limit: 100,
            success_threshold: 0.95,
            latency_threshold: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl OnboardingStormConfig {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.fleet.validate()?;
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(ScenarioError::Config("success_threshold must be within [0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OnboardingStormMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub devices_started: u64,
    pub devices_successful: u64,
    pub devices_failed: u64,
    #[serde(skip)]
    pub registration_latencies: Vec<Duration>,
    #[serde(with = "humantime_serde")]
    pub p50_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_latency: Duration,
    pub peak_concurrency: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub batches_started: u64,
    pub batches_completed: u64,
    pub device_started_events: u64,
    pub device_error_events: u64,
    pub dropped_events: u64,
    pub onboarding_rate: f64,
}

impl OnboardingStormMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.devices_started == 0 {
            return 0.0;
        }
        self.devices_successful as f64 / self.devices_started as f64
    }

    fn absorb(&mut self, fleet: &FleetMetrics) {
        self.devices_started = fleet.successful_requests + fleet.failed_requests;
        self.devices_successful = fleet.successful_requests;
        self.devices_failed = fleet.failed_requests;
        self.total_requests = fleet.total_requests;
        self.failed_requests = fleet.failed_requests;
        self.dropped_events = fleet.dropped_events;
        self.peak_concurrency = self.peak_concurrency.max(fleet.active());
    }

    fn record_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::DeviceStarted => {
                self.device_started_events += 1;
                debug!(device_id = ?event.device_id, "device started");
            }
            EventType::DeviceError => {
                self.device_error_events += 1;
                warn!(device_id = ?event.device_id, message = %event.message, "device error during onboarding");
            }
            EventType::BatchStarted => {
                self.batches_started += 1;
                info!(batch_size = event.data_u64("batch_size"), "starting onboarding batch");
            }
            EventType::BatchCompleted => {
                self.batches_completed += 1;
                info!(batch_number = event.data_u64("batch_number"), "completed onboarding batch");
            }
            _ => {}
        }
    }
}

pub struct OnboardingStormScenario {
    config: OnboardingStormConfig,
    rng: SharedRandom,
    metrics: RwLock<OnboardingStormMetrics>,
}

impl OnboardingStormScenario {
    pub fn new(config: OnboardingStormConfig) -> Self {
        Self {
            config,
            rng: thread_random(),
            metrics: RwLock::new(OnboardingStormMetrics::default()),
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &OnboardingStormConfig {
        &self.config
    }

    pub fn metrics(&self) -> OnboardingStormMetrics {
        self.metrics.read().clone()
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ScenarioError> {
        self.config.validate()?;
        let started = Instant::now();
        *self.metrics.write() = OnboardingStormMetrics { started_at: Some(Utc::now()), ..Default::default() };

        info!(
            scenario = "onboarding_storm",
            total_devices = self.config.fleet.total_devices,
            burst_size = self.config.burst_size,
            burst_interval = ?self.config.burst_interval,
            test_duration = ?self.config.test_duration,
            "starting onboarding storm scenario"
        );

        let fleet = self
            .config
            .fleet
            .clone()
            .with_batches(self.config.burst_size, self.config.burst_interval, self.config.concurrency_limit)
            .build(cancel, self.rng.clone(), self.config.test_duration);
        let events = fleet.take_events();

        guarded(&fleet, async {
            let monitor_cancel = cancel.child_token();
            let (outcome, events) = tokio::join!(
                async {
                    let outcome = self.storm(&fleet, cancel, started).await;
                    monitor_cancel.cancel();
                    outcome
                },
                self.monitor(&fleet, events, &monitor_cancel),
            );

            self.finalize(&fleet, events, started.elapsed());
            outcome?;
            self.analyze()
        })
        .await
    }

    async fn storm(&self, fleet: &FleetSimulator, cancel: &CancellationToken, started: Instant) -> Result<(), ScenarioError> {
        info!("executing onboarding storm");
        let start = Instant::now();
        start_fleet(fleet, started).await?;
        let latency = start.elapsed();

        let devices_started = {
            let mut m = self.metrics.write();
            m.registration_latencies.push(latency);
            m.absorb(&fleet.metrics());
            m.devices_started
        };
        info!(duration = ?latency, devices_started, "onboarding storm completed");

        pause(cancel, self.config.test_duration, started).await?;
        info!("onboarding observation window completed");
        Ok(())
    }

    /// Rend le récepteur pour vider les événements restants.
    async fn monitor(
        &self,
        fleet: &FleetSimulator,
        mut events: Option<mpsc::Receiver<Event>>,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<Event>> {
        let period = self.config.monitor_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            let mut closed = false;
            let next_event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample(&fleet.metrics()),
                event = next_event => match event {
                    Some(event) => self.metrics.write().record_event(&event),
                    None => closed = true,
                },
            }
            if closed {
                events = None;
            }
        }
        events
    }

    fn sample(&self, fleet: &FleetMetrics) {
        let mut m = self.metrics.write();
        m.absorb(fleet);
        debug!(
            devices_started = m.devices_started,
            devices_successful = m.devices_successful,
            devices_failed = m.devices_failed,
            success_rate = m.success_rate(),
            "onboarding progress"
        );
    }

    fn finalize(&self, fleet: &FleetSimulator, events: Option<mpsc::Receiver<Event>>, elapsed: Duration) {
        let fleet_metrics = fleet.refresh_metrics();
        let mut m = self.metrics.write();
        if let Some(mut rx) = events {
            while let Ok(event) = rx.try_recv() {
                m.record_event(&event);
            }
        }
        m.absorb(&fleet_metrics);
        m.ended_at = Some(Utc::now());
        m.p50_latency = percentile(&m.registration_latencies, 0.5);
        m.p95_latency = percentile(&m.registration_latencies, 0.95);
        m.p99_latency = percentile(&m.registration_latencies, 0.99);
        if elapsed > Duration::ZERO {
            m.onboarding_rate = m.devices_started as f64 / elapsed.as_secs_f64();
        }

        info!(
            duration = ?elapsed,
            devices_started = m.devices_started,
            devices_successful = m.devices_successful,
            devices_failed = m.devices_failed,
            success_rate = m.success_rate(),
            peak_concurrency = m.peak_concurrency,
            total_requests = m.total_requests,
            failed_requests = m.failed_requests,
            p50 = ?m.p50_latency,
            p95 = ?m.p95_latency,
            p99 = ?m.p99_latency,
            devices_per_second = m.onboarding_rate,
            "onboarding storm results"
        );
    }

    fn analyze(&self) -> Result<(), ScenarioError> {
        let m = self.metrics.read();
        let mut violations = Violations::new();
        violations.check(!m.registration_latencies.is_empty() && m.p95_latency > self.config.latency_threshold, || {
            format!("p95 latency {:?} exceeds threshold {:?}", m.p95_latency, self.config.latency_threshold)
        });
        violations.check(m.success_rate() < self.config.success_threshold, || {
            format!(
                "success rate {} below threshold {}",
                percent(m.success_rate()),
                percent(self.config.success_threshold)
            )
        });

        if violations.is_empty() {
            info!("onboarding storm scenario PASSED");
        }
        violations.into_result()
    }
}

impl Scenario for OnboardingStormScenario {
    fn name(&self) -> &'static str {
        "onboarding_storm"
    }

    fn description(&self) -> &'static str {
        "Simulates rapid device registration to test onboarding system scalability"
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
    use std::sync::Arc;

    fn quiet_config(devices: usize) -> OnboardingStormConfig {
        let timing = DeviceTiming::new(Duration::from_secs(5), Duration::from_secs(10))
            .with_checks(Duration::from_secs(3600), Duration::from_secs(3600));
        OnboardingStormConfig {
            fleet: ScenarioFleet::new([0.2, 0.5, 0.3], 50, Duration::from_secs(2), 100)
                .with_devices(devices)
                .with_timing(timing),
            test_duration: Duration::from_secs(5),
            burst_size: 10,
            burst_interval: Duration::from_secs(1),
            concurrency_limit: 5,
            ..Default::default()
        }
    }

    fn scenario(config: OnboardingStormConfig) -> OnboardingStormScenario {
        OnboardingStormScenario::new(config).with_random(Arc::new(FixedRandom::new(0.99)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_storm_onboards_every_device() {
        let scenario = scenario(quiet_config(25));
        scenario.execute(&CancellationToken::new()).await.unwrap();

        let m = scenario.metrics();
        assert_eq!(m.devices_started, 25);
        assert_eq!(m.devices_successful, 25);
        assert_eq!(m.devices_failed, 0);
        assert_eq!(m.success_rate(), 1.0);
        assert_eq!(m.peak_concurrency, 25);
        assert_eq!(m.batches_started, 3);
        assert_eq!(m.batches_completed, 3);
        assert_eq!(m.device_started_events, 25);
        assert_eq!(m.device_error_events, 0);
        // deux intervalles entre trois rafales
        assert!(m.p95_latency >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_onboarding_reports_latency_violation() {
        let mut config = quiet_config(25);
        config.latency_threshold = Duration::from_millis(500);
        let scenario = scenario(config);

        let err = scenario.execute(&CancellationToken::new()).await.unwrap_err();
        let violations = err.violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("p95 latency"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scenario(quiet_config(10)).execute(&cancel).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Cancelled(_)));
    }

    #[test]
    fn test_metrics_serialization() {
        let m = OnboardingStormMetrics { p95_latency: Duration::from_secs(3), ..Default::default() };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["p95_latency"], "3s");
        assert!(json.get("registration_latencies").is_none());
    }
}
