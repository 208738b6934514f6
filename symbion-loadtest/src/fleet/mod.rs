/**
 * FLEET SIMULATOR - Orchestration d'une flotte de devices virtuels
 *
 * RÔLE : Crée les devices selon une distribution de profils, les démarre par
 * lots à concurrence bornée, agrège les métriques de flotte et publie un flux
 * d'événements borné.
 *
 * FONCTIONNEMENT :
 * - Lots strictement séquentiels, démarrages concurrents dans un lot (sémaphore)
 * - Une tâche d'agrégation périodique ; tout rafraîchissement (périodique ou
 *   ponctuel) prend le même verrou d'écriture, relevé et publication compris
 * - Jeton d'annulation de flotte, parent de celui de chaque device
 * - Partition réseau et mise à l'échelle en tâches de fond (best-effort)
 *
 * UTILITÉ : Support d'exécution commun à tous les scénarios de charge.
 */

pub mod events;
pub mod metrics;

pub use events::{DeviceEvents, Event, EventBus, EventType, DEFAULT_EVENT_CAPACITY};
pub use metrics::{FleetMetrics, RequestCounters};

use crate::device::{DeviceConfig, DeviceProfile, VirtualDevice};
use crate::error::FleetError;
use crate::random::{thread_random, SharedRandom};
use crate::timing::sleep_or_cancel;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_CONCURRENCY: usize = 20;
const DEFAULT_STOP_CONCURRENCY: usize = 50;
const MIN_AGGREGATION_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub server_url: String,
    pub total_devices: usize,
    pub device_profiles: BTreeMap<DeviceProfile, usize>,
    pub startup_batch_size: usize,
    pub startup_batch_interval: Duration,
    /// Plafond de démarrages simultanés dans un lot
    pub max_concurrent_requests: usize,
    pub stop_concurrency: usize,
    pub aggregation_interval: Duration,
    pub event_capacity: usize,
    /// Publie aussi un événement par envoi de métriques et de heartbeat
    pub traffic_events: bool,
    pub auth_token: Option<String>,
    pub tls_enabled: bool,
    pub test_duration: Duration,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
    pub device_timing: Option<DeviceTiming>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            total_devices: 0,
            device_profiles: BTreeMap::new(),
            startup_batch_size: DEFAULT_BATCH_SIZE,
            startup_batch_interval: Duration::from_secs(1),
            max_concurrent_requests: DEFAULT_BATCH_CONCURRENCY,
            stop_concurrency: DEFAULT_STOP_CONCURRENCY,
            aggregation_interval: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            traffic_events: false,
            auth_token: None,
            tls_enabled: false,
            test_duration: Duration::from_secs(10 * 60),
            ramp_up: Duration::ZERO,
            ramp_down: Duration::ZERO,
            device_timing: None,
        }
    }
}

impl FleetConfig {
    /// Flotte décrite par un nombre de devices par profil ; le total en découle.
    pub fn with_profiles(device_profiles: BTreeMap<DeviceProfile, usize>) -> Self {
        let total_devices = device_profiles.values().sum();
        Self { total_devices, device_profiles, ..Default::default() }
    }

    pub fn with_batches(mut self, size: usize, interval: Duration, concurrency: usize) -> Self {
        self.startup_batch_size = size;
        self.startup_batch_interval = interval;
        self.max_concurrent_requests = concurrency;
        self
    }

    pub fn with_timing(mut self, timing: DeviceTiming) -> Self {
        self.device_timing = Some(timing);
        self
    }

    // Les zéros valent "par défaut"
    fn normalized(mut self) -> Self {
        if self.startup_batch_size == 0 {
            self.startup_batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.max_concurrent_requests == 0 {
            self.max_concurrent_requests = DEFAULT_BATCH_CONCURRENCY;
        }
        if self.stop_concurrency == 0 {
            self.stop_concurrency = DEFAULT_STOP_CONCURRENCY;
        }
        self
    }
}

/// Surcharge des intervalles et du taux d'erreur de tous les devices créés
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTiming {
    pub metrics_interval: Duration,
    pub heartbeat_interval: Duration,
    pub state_check_interval: Duration,
    pub fault_check_interval: Duration,
    pub error_rate: Option<f64>,
}

impl DeviceTiming {
    pub fn new(metrics_interval: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            metrics_interval,
            heartbeat_interval,
            state_check_interval: Duration::from_secs(10),
            fault_check_interval: Duration::from_secs(60),
            error_rate: None,
        }
    }

    pub fn with_checks(mut self, state_check: Duration, fault_check: Duration) -> Self {
        self.state_check_interval = state_check;
        self.fault_check_interval = fault_check;
        self
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = Some(error_rate);
        self
    }

    pub fn apply(&self, config: DeviceConfig) -> DeviceConfig {
        let config = config
            .with_intervals(self.metrics_interval, self.heartbeat_interval)
            .with_check_intervals(self.state_check_interval, self.fault_check_interval);
        match self.error_rate {
            Some(rate) => config.with_error_rate(rate),
            None => config,
        }
    }
}

/// One startup batch, timestamps relative to the fleet's creation
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub number: usize,
    pub size: usize,
    #[serde(with = "humantime_serde")]
    pub started_at: Duration,
    #[serde(with = "humantime_serde")]
    pub completed_at: Duration,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Default)]
struct Registry {
    order: Vec<Arc<VirtualDevice>>,
    by_id: HashMap<String, Arc<VirtualDevice>>,
    issued: HashSet<String>,
}

impl Registry {
    fn insert(&mut self, device: Arc<VirtualDevice>) {
        self.by_id.insert(device.id().to_string(), device.clone());
        self.order.push(device);
    }

    fn remove(&mut self, id: &str) {
        if self.by_id.remove(id).is_some() {
            self.order.retain(|d| d.id() != id);
        }
    }
}

/// Parties partagées avec la tâche d'agrégation et les fan-outs
struct FleetShared {
    registry: RwLock<Registry>,
    metrics: RwLock<FleetMetrics>,
    requests: RequestCounters,
    events: Arc<EventBus>,
    /// Un seul rafraîchissement à la fois : relevé des états puis publication
    refresh_lock: Mutex<()>,
}

impl FleetShared {
    fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.registry.read().order.clone()
    }

    fn refresh(&self) {
        let _writer = self.refresh_lock.lock();
        let states: Vec<_> = self.devices().iter().map(|d| d.state()).collect();
        let start_time = self.metrics.read().start_time;
        let mut fresh = FleetMetrics::aggregate(&states).with_requests(&self.requests);
        fresh.start_time = start_time;
        fresh.dropped_events = self.events.dropped();
        *self.metrics.write() = fresh;
    }
}

pub struct FleetSimulator {
    config: FleetConfig,
    rng: SharedRandom,
    cancel: CancellationToken,
    shared: Arc<FleetShared>,
    observer: Arc<DeviceEvents>,
    lifecycle: Mutex<Lifecycle>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    batches: Mutex<Vec<BatchRecord>>,
    scaling: tokio::sync::Mutex<()>,
    created: Instant,
}

impl FleetSimulator {
    pub fn new(config: FleetConfig) -> Self {
        let config = config.normalized();
        let events = Arc::new(EventBus::new(config.event_capacity));
        let observer = Arc::new(DeviceEvents::new(events.clone(), config.traffic_events));
        Self {
            observer,
            rng: thread_random(),
            cancel: CancellationToken::new(),
            shared: Arc::new(FleetShared {
                registry: RwLock::new(Registry::default()),
                metrics: RwLock::new(FleetMetrics::default()),
                requests: RequestCounters::default(),
                events,
                refresh_lock: Mutex::new(()),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
            aggregator: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
            scaling: tokio::sync::Mutex::new(()),
            created: Instant::now(),
            config,
        }
    }

    pub fn with_random(mut self, rng: SharedRandom) -> Self {
        self.rng = rng;
        self
    }

    /// Rattache la flotte à un jeton parent (celui du scénario).
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn start(&self) -> Result<(), FleetError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => return Err(FleetError::AlreadyStarted),
                Lifecycle::Stopped => return Err(FleetError::Stopped),
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
            }
        }

        info!(
            component = "fleet_simulator",
            total_devices = self.config.total_devices,
            batch_size = self.config.startup_batch_size,
            concurrency = self.config.max_concurrent_requests,
            "starting fleet simulation"
        );
        self.shared.metrics.write().start_time = Some(Utc::now());
        self.spawn_aggregator();
        self.shared.events.publish(
            Event::new(EventType::FleetStarted, "fleet simulation started")
                .with_data(json!({ "total_devices": self.config.total_devices })),
        );

        let mut devices = Vec::with_capacity(self.config.total_devices);
        for (profile, count) in &self.config.device_profiles {
            for _ in 0..*count {
                devices.push(self.create_device(*profile));
            }
        }
        info!(created = devices.len(), "created virtual devices");

        self.start_in_batches(&devices).await?;
        self.shared.refresh();
        info!(component = "fleet_simulator", "fleet simulation started successfully");
        Ok(())
    }

    /// Arrête tous les devices puis l'agrégation ; ferme le flux d'événements.
    /// Un second appel est sans effet.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        info!(component = "fleet_simulator", "stopping fleet simulation");
        let devices = self.shared.devices();
        self.stop_devices(&devices).await;

        self.cancel.cancel();
        let aggregator = self.aggregator.lock().take();
        if let Some(handle) = aggregator {
            if let Err(e) = handle.await {
                warn!("metrics aggregation task failed: {e}");
            }
        }

        self.shared.refresh();
        self.shared.events.publish(Event::new(EventType::FleetStopped, "fleet simulation stopped"));
        self.shared.events.close();
        info!(component = "fleet_simulator", "fleet simulation stopped");
    }

    /// Réconcilie la flotte vers `targets` en tâche de fond.
    pub fn scale_fleet(self: &Arc<Self>, targets: BTreeMap<DeviceProfile, usize>) -> JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move { fleet.reconcile(targets).await })
    }

    /// Coupe un préfixe déterministe de la liste de devices pendant `duration`.
    pub fn simulate_network_partition(self: &Arc<Self>, fraction: f64, duration: Duration) -> JoinHandle<()> {
        let fleet = self.clone();
        tokio::spawn(async move { fleet.partition(fraction, duration).await })
    }

    pub fn device(&self, id: &str) -> Result<Arc<VirtualDevice>, FleetError> {
        self.shared
            .registry
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::DeviceNotFound(id.to_string()))
    }

    /// Devices in creation order.
    pub fn list_devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.shared.devices()
    }

    pub fn devices_by_profile(&self, profile: DeviceProfile) -> Vec<Arc<VirtualDevice>> {
        self.shared
            .registry
            .read()
            .order
            .iter()
            .filter(|d| d.profile() == profile)
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> FleetMetrics {
        self.shared.metrics.read().clone()
    }

    /// One aggregation pass outside the periodic schedule.
    pub fn refresh_metrics(&self) -> FleetMetrics {
        self.shared.refresh();
        self.metrics()
    }

    /// Le récepteur unique du flux d'événements.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.shared.events.take_receiver()
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.events.dropped()
    }

    pub fn batch_log(&self) -> Vec<BatchRecord> {
        self.batches.lock().clone()
    }

    fn create_device(&self, profile: DeviceProfile) -> Arc<VirtualDevice> {
        let mut registry = self.shared.registry.write();
        let mut id = Uuid::new_v4().to_string();
        while registry.issued.contains(&id) {
            id = Uuid::new_v4().to_string();
        }
        registry.issued.insert(id.clone());

        let name = format!("{}-device-{}", profile, registry.issued.len());
        let mut config = DeviceConfig::for_profile(profile, id)
            .with_name(name)
            .with_server(self.config.server_url.clone(), self.config.tls_enabled, self.config.auth_token.clone());
        if let Some(timing) = &self.config.device_timing {
            config = timing.apply(config);
        }

        let device = Arc::new(VirtualDevice::observed(
            config,
            self.rng.clone(),
            self.cancel.clone(),
            self.observer.clone(),
        ));
        registry.insert(device.clone());
        device
    }

    fn spawn_aggregator(&self) {
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let period = self.config.aggregation_interval.max(MIN_AGGREGATION_PERIOD);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => shared.refresh(),
                }
            }
            debug!("metrics aggregation stopped");
        });
        *self.aggregator.lock() = Some(handle);
    }

    async fn start_in_batches(&self, devices: &[Arc<VirtualDevice>]) -> Result<(), FleetError> {
        let batch_size = self.config.startup_batch_size;
        let batch_count = devices.len().div_ceil(batch_size);

        for (index, batch) in devices.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }

            let number = self.batches.lock().len() + 1;
            let started_at = self.created.elapsed();
            info!(batch = number, size = batch.len(), "starting device batch");
            self.shared.events.publish(
                Event::new(EventType::BatchStarted, format!("Starting batch {} with {} devices", number, batch.len()))
                    .with_data(json!({ "batch_number": number, "batch_size": batch.len() })),
            );

            let failures = self.start_devices(batch).await;

            self.batches.lock().push(BatchRecord {
                number,
                size: batch.len(),
                started_at,
                completed_at: self.created.elapsed(),
                failures,
            });
            self.shared.events.publish(
                Event::new(EventType::BatchCompleted, format!("Completed batch {}", number))
                    .with_data(json!({ "batch_number": number, "batch_size": batch.len(), "failures": failures })),
            );

            if index + 1 < batch_count && !sleep_or_cancel(&self.cancel, self.config.startup_batch_interval).await {
                return Err(FleetError::Cancelled);
            }
        }
        // annulé pendant le dernier lot : ses échecs ne sont pas des échecs de démarrage
        if self.cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }
        Ok(())
    }

    /// Démarre un lot en parallèle borné ; retourne le nombre d'échecs.
    async fn start_devices(&self, batch: &[Arc<VirtualDevice>]) -> usize {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_requests));
        let mut tasks = JoinSet::new();
        for device in batch {
            let device = device.clone();
            let permits = permits.clone();
            let shared = self.shared.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return false;
                };
                match device.start().await {
                    Ok(()) => {
                        shared.requests.record(true);
                        shared.events.publish(
                            Event::new(EventType::DeviceStarted, "device started")
                                .for_device(device.id())
                                .with_data(json!({ "profile": device.profile() })),
                        );
                        true
                    }
                    Err(e) => {
                        shared.requests.record(false);
                        warn!(device_id = %device.id(), "failed to start device: {e}");
                        shared.events.publish(
                            Event::new(EventType::DeviceError, format!("failed to start device: {e}"))
                                .for_device(device.id()),
                        );
                        false
                    }
                }
            });
        }

        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            if !matches!(joined, Ok(true)) {
                failures += 1;
            }
        }
        failures
    }

    async fn stop_devices(&self, devices: &[Arc<VirtualDevice>]) {
        let permits = Arc::new(Semaphore::new(self.config.stop_concurrency));
        let mut tasks = JoinSet::new();
        for device in devices {
            let device = device.clone();
            let permits = permits.clone();
            let shared = self.shared.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if !device.is_started() {
                    return;
                }
                device.stop().await;
                shared.events.publish(Event::new(EventType::DeviceStopped, "device stopped").for_device(device.id()));
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn reconcile(&self, targets: BTreeMap<DeviceProfile, usize>) {
        let _guard = self.scaling.lock().await;
        if *self.lifecycle.lock() == Lifecycle::Stopped {
            warn!("scale request ignored: fleet stopped");
            return;
        }
        info!(component = "fleet_simulator", ?targets, "scaling fleet");

        for (profile, target) in &targets {
            let current = self.devices_by_profile(*profile);
            if *target > current.len() {
                let added: Vec<_> = (current.len()..*target).map(|_| self.create_device(*profile)).collect();
                info!(profile = %profile, added = added.len(), "adding devices");
                if let Err(e) = self.start_in_batches(&added).await {
                    warn!(profile = %profile, "scale up interrupted: {e}");
                    return;
                }
            } else if *target < current.len() {
                let removed = &current[*target..];
                info!(profile = %profile, removed = removed.len(), "removing devices");
                self.stop_devices(removed).await;
                let mut registry = self.shared.registry.write();
                for device in removed {
                    registry.remove(device.id());
                }
            }
        }

        self.shared.refresh();
        self.shared.events.publish(
            Event::new(EventType::FleetScaled, "fleet scaled")
                .with_data(json!({ "total_devices": self.shared.registry.read().order.len() })),
        );
    }

    async fn partition(&self, fraction: f64, duration: Duration) {
        let devices = self.shared.devices();
        let affected = ((devices.len() as f64) * fraction.clamp(0.0, 1.0)) as usize;
        let selected = &devices[..affected.min(devices.len())];
        info!(component = "fleet_simulator", affected, ?duration, "simulating network partition");
        self.shared.events.publish(
            Event::new(EventType::PartitionStarted, "network partition started")
                .with_data(json!({ "affected": affected, "duration_ms": duration.as_millis() as u64 })),
        );

        self.stop_devices(selected).await;
        self.shared.refresh();

        if !sleep_or_cancel(&self.cancel, duration).await {
            debug!("partition interrupted by cancellation");
            return;
        }

        let failures = self.start_devices(selected).await;
        self.shared.refresh();
        self.shared.events.publish(
            Event::new(EventType::PartitionEnded, "network partition ended")
                .with_data(json!({ "affected": affected, "failures": failures })),
        );
    }
}

impl Drop for FleetSimulator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for FleetSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetSimulator")
            .field("total_devices", &self.config.total_devices)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use crate::random::FixedRandom;

    fn quiet_fleet(counts: &[(DeviceProfile, usize)], batch_size: usize) -> FleetSimulator {
        let profiles: BTreeMap<_, _> = counts.iter().copied().collect();
        let timing = DeviceTiming::new(Duration::from_secs(1), Duration::from_secs(2))
            .with_checks(Duration::from_secs(3600), Duration::from_secs(3600));
        let config = FleetConfig::with_profiles(profiles)
            .with_batches(batch_size, Duration::from_millis(100), 5)
            .with_timing(timing);
        FleetSimulator::new(config).with_random(Arc::new(FixedRandom::new(0.99)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_in_three_batches() {
        let fleet = quiet_fleet(&[(DeviceProfile::Full, 25)], 10);
        fleet.start().await.unwrap();

        let sizes: Vec<_> = fleet.batch_log().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![10, 10, 5]);

        let metrics = fleet.metrics();
        assert_eq!(metrics.online, 25);
        assert_eq!(metrics.total_devices, 25);
        assert_eq!(metrics.successful_requests, 25);
        assert_eq!(metrics.failed_requests, 0);
        assert!(metrics.start_time.is_some());
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_overlap() {
        let fleet = quiet_fleet(&[(DeviceProfile::Constrained, 40), (DeviceProfile::Minimal, 7)], 6);
        fleet.start().await.unwrap();
        let log = fleet.batch_log();
        assert_eq!(log.len(), 8);
        for pair in log.windows(2) {
            assert!(pair[1].started_at >= pair[0].completed_at);
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_ids_unique_and_ordered() {
        let fleet = Arc::new(quiet_fleet(&[(DeviceProfile::Full, 10), (DeviceProfile::Minimal, 10)], 10));
        fleet.start().await.unwrap();
        fleet
            .scale_fleet(BTreeMap::from([(DeviceProfile::Full, 15), (DeviceProfile::Minimal, 5)]))
            .await
            .unwrap();
        fleet.scale_fleet(BTreeMap::from([(DeviceProfile::Minimal, 12)])).await.unwrap();

        let devices = fleet.list_devices();
        assert_eq!(devices.len(), 27);
        let ids: HashSet<_> = devices.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids.len(), devices.len());
        assert_eq!(devices[0].profile(), DeviceProfile::Full);
        assert_eq!(fleet.devices_by_profile(DeviceProfile::Full).len(), 15);
        assert_eq!(fleet.devices_by_profile(DeviceProfile::Minimal).len(), 12);
        assert_eq!(fleet.metrics().online, 27);
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let fleet = quiet_fleet(&[(DeviceProfile::Minimal, 12)], 5);
        let mut events = fleet.take_events().unwrap();
        fleet.start().await.unwrap();
        fleet.stop().await;
        fleet.stop().await;

        assert_eq!(fleet.metrics().offline, 12);
        assert!(matches!(fleet.start().await, Err(FleetError::Stopped)));

        let mut stopped = 0;
        let mut fleet_stopped = 0;
        while let Some(event) = events.recv().await {
            match event.event_type {
                EventType::DeviceStopped => stopped += 1,
                EventType::FleetStopped => fleet_stopped += 1,
                _ => {}
            }
        }
        assert_eq!(stopped, 12);
        assert_eq!(fleet_stopped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let fleet = quiet_fleet(&[(DeviceProfile::Full, 3)], 10);
        fleet.start().await.unwrap();
        assert!(matches!(fleet.start().await, Err(FleetError::AlreadyStarted)));
        assert!(matches!(fleet.device("missing"), Err(FleetError::DeviceNotFound(_))));
        let first = fleet.list_devices()[0].clone();
        assert_eq!(fleet.device(first.id()).unwrap().id(), first.id());
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_parent_aborts_start() {
        let parent = CancellationToken::new();
        let fleet = quiet_fleet(&[(DeviceProfile::Full, 30)], 10).with_parent(&parent);
        parent.cancel();
        assert!(matches!(fleet.start().await, Err(FleetError::Cancelled)));
        assert!(fleet.batch_log().is_empty());
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_last_batch_fails_start() {
        let parent = CancellationToken::new();
        let fleet = quiet_fleet(&[(DeviceProfile::Full, 5)], 10).with_parent(&parent);
        // le lot unique est en cours quand le jeton tombe
        let (started, _) = tokio::join!(fleet.start(), async { parent.cancel() });
        assert!(matches!(started, Err(FleetError::Cancelled)));
        let log = fleet.batch_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].failures, 5);
        fleet.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_keep_latest_snapshot() {
        let fleet = Arc::new(quiet_fleet(&[(DeviceProfile::Full, 40)], 40));
        fleet.start().await.unwrap();

        for _ in 0..5 {
            let partition = fleet.simulate_network_partition(0.5, Duration::from_millis(20));
            let scale = fleet.scale_fleet(BTreeMap::from([(DeviceProfile::Full, 40)]));
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let fleet = fleet.clone();
                    tokio::spawn(async move {
                        for _ in 0..50 {
                            fleet.refresh_metrics();
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();
            partition.await.unwrap();
            scale.await.unwrap();
            for reader in readers {
                reader.await.unwrap();
            }

            // le dernier écrit vient du relevé le plus récent
            let online = fleet.list_devices().iter().filter(|d| d.status() == DeviceStatus::Online).count();
            assert_eq!(online, 40);
            assert_eq!(fleet.metrics().online, online);
        }
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_restarts_prefix() {
        let fleet = Arc::new(quiet_fleet(&[(DeviceProfile::Full, 20)], 20));
        fleet.start().await.unwrap();

        let handle = fleet.simulate_network_partition(0.25, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let devices = fleet.list_devices();
        assert!(devices[..5].iter().all(|d| d.status() == DeviceStatus::Offline));
        assert!(devices[5..].iter().all(|d| d.status() == DeviceStatus::Online));
        assert_eq!(fleet.metrics().offline, 5);

        handle.await.unwrap();
        assert_eq!(fleet.metrics().online, 20);
        fleet.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_activity_reaches_event_stream() {
        let timing = DeviceTiming::new(Duration::from_secs(1), Duration::from_secs(2))
            .with_checks(Duration::from_secs(3600), Duration::from_secs(3600));
        let mut config = FleetConfig::with_profiles(BTreeMap::from([(DeviceProfile::Full, 6)]))
            .with_batches(6, Duration::from_millis(100), 6)
            .with_timing(timing);
        config.traffic_events = true;
        let fleet = Arc::new(FleetSimulator::new(config).with_random(Arc::new(FixedRandom::new(0.99))));
        let mut events = fleet.take_events().unwrap();

        fleet.start().await.unwrap();
        fleet.simulate_network_partition(0.5, Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        fleet.stop().await;

        let mut counts: HashMap<EventType, u64> = HashMap::new();
        while let Some(event) = events.recv().await {
            *counts.entry(event.event_type).or_default() += 1;
        }
        let metrics = fleet.metrics();
        // redémarrés après la partition, mais enregistrés une seule fois
        assert_eq!(counts[&EventType::DeviceRegistered], 6);
        assert_eq!(counts[&EventType::DeviceStarted], 9);
        assert_eq!(counts[&EventType::MetricsSent], metrics.total_metrics_sent);
        assert_eq!(counts[&EventType::HeartbeatSent], metrics.total_messages_sent);
        assert_eq!(fleet.dropped_events(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregation_tracks_device_counters() {
        let fleet = quiet_fleet(&[(DeviceProfile::Full, 4)], 4);
        fleet.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        let metrics = fleet.metrics();
        assert!(metrics.total_metrics_sent >= 4 * 6);
        assert!(metrics.total_messages_sent >= 4 * 3);
        assert_eq!(metrics.total_errors, 0);
        fleet.stop().await;
    }
}
