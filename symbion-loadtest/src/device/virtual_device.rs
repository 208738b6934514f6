/**
 * VIRTUAL DEVICE - Acteur simulé à cycle de vie autonome
 *
 * RÔLE : Simule un device entre `start()` et `stop()` : télémétrie, heartbeat,
 * transitions d'état spontanées et injection de pannes, chacune dans sa tâche.
 *
 * FONCTIONNEMENT : Chaque démarrage crée un jeton d'annulation enfant du jeton
 * parent (celui de la fleet). `stop()` annule, attend les 4 tâches puis force
 * Offline. Tous les envois sont simulés par une courte attente.
 *
 * UTILITÉ : Unité de charge du FleetSimulator ; seul écrivain de son DeviceState.
 */

use super::{DeviceConfig, DeviceMetrics, DeviceProfile, DeviceState, DeviceStatus, MetricsGenerator, RateLimiter};
use crate::error::DeviceError;
use crate::random::SharedRandom;
use crate::timing::{jittered, sleep_or_cancel};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HISTORY_CAPACITY: usize = 64;
const METRICS_SEND_LATENCY: (Duration, Duration) = (Duration::from_millis(10), Duration::from_millis(50));
const HEARTBEAT_SEND_LATENCY: (Duration, Duration) = (Duration::from_millis(5), Duration::from_millis(25));
const MIN_CHECK_PERIOD: Duration = Duration::from_millis(1);
const FAULT_RECOVERY: (Duration, Duration) = (Duration::from_secs(5), Duration::from_secs(30));

/// One recorded status change
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub at: DateTime<Utc>,
}

/// Reçoit l'enregistrement et les envois réussis d'un device.
pub trait DeviceObserver: Send + Sync {
    fn registered(&self, device_id: &str, profile: DeviceProfile);
    fn metrics_sent(&self, device_id: &str);
    fn heartbeat_sent(&self, device_id: &str);
}

pub struct VirtualDevice {
    inner: Arc<DeviceInner>,
    parent: CancellationToken,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

struct RunHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

struct DeviceInner {
    config: DeviceConfig,
    rng: SharedRandom,
    limiter: RateLimiter,
    state: RwLock<DeviceState>,
    history: Mutex<VecDeque<StatusChange>>,
    generator: Mutex<MetricsGenerator>,
    started: AtomicBool,
    run_started: Mutex<Option<Instant>>,
    observer: Option<Arc<dyn DeviceObserver>>,
}

impl VirtualDevice {
    pub fn new(config: DeviceConfig, rng: SharedRandom, parent: CancellationToken) -> Self {
        Self::build(config, rng, parent, None)
    }

    pub fn observed(
        config: DeviceConfig,
        rng: SharedRandom,
        parent: CancellationToken,
        observer: Arc<dyn DeviceObserver>,
    ) -> Self {
        Self::build(config, rng, parent, Some(observer))
    }

    fn build(
        config: DeviceConfig,
        rng: SharedRandom,
        parent: CancellationToken,
        observer: Option<Arc<dyn DeviceObserver>>,
    ) -> Self {
        let limiter = RateLimiter::new(config.requests_per_second);
        let generator = Mutex::new(MetricsGenerator::new(&config));
        Self {
            inner: Arc::new(DeviceInner {
                config,
                rng,
                limiter,
                state: RwLock::new(DeviceState::default()),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                generator,
                started: AtomicBool::new(false),
                run_started: Mutex::new(None),
                observer,
            }),
            parent,
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.device_id
    }

    pub fn profile(&self) -> DeviceProfile {
        self.inner.config.profile
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DeviceStatus {
        self.inner.state.read().status
    }

    /// Snapshot en lecture seule ; l'uptime est calculé à l'instant de la lecture.
    pub fn state(&self) -> DeviceState {
        let mut snapshot = self.inner.state.read().clone();
        snapshot.uptime = self.inner.uptime();
        snapshot
    }

    pub fn metrics(&self) -> DeviceMetrics {
        self.inner.generator.lock().snapshot()
    }

    pub fn status_history(&self) -> Vec<StatusChange> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Transition demandée de l'extérieur (ex: campagne de mise à jour).
    /// Refusée si elle ne fait pas partie de la machine d'état.
    pub fn set_status(&self, next: DeviceStatus) -> bool {
        self.inner.transition(next)
    }

    /// Transition conditionnelle : n'agit que si le statut courant vaut `expected`.
    pub fn transition_from(&self, expected: DeviceStatus, next: DeviceStatus) -> bool {
        self.inner.transition_from(expected, next)
    }

    pub async fn start(&self) -> Result<(), DeviceError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(DeviceError::AlreadyStarted(self.id().to_string()));
        }
        if self.parent.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }

        let cfg = &self.inner.config;
        info!(
            device_id = %cfg.device_id,
            profile = %cfg.profile,
            metrics_interval = ?cfg.metrics_interval,
            heartbeat_interval = ?cfg.heartbeat_interval,
            "starting virtual device"
        );

        let first_start = {
            let mut state = self.inner.state.write();
            state.started_at = Some(Utc::now());
            !std::mem::replace(&mut state.registered, true)
        };
        if first_start {
            if let Some(observer) = &self.inner.observer {
                observer.registered(&cfg.device_id, cfg.profile);
            }
        }
        *self.inner.run_started.lock() = Some(Instant::now());
        self.inner.transition(DeviceStatus::Online);

        let cancel = self.parent.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(telemetry_loop(self.inner.clone(), cancel.clone()));
        tasks.spawn(heartbeat_loop(self.inner.clone(), cancel.clone()));
        tasks.spawn(state_loop(self.inner.clone(), cancel.clone()));
        tasks.spawn(fault_loop(self.inner.clone(), cancel.clone()));

        *run = Some(RunHandle { cancel, tasks });
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Annule les tâches, les attend, force Offline. Sans effet si déjà arrêté.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(mut handle) = run.take() else {
            return;
        };

        debug!(device_id = %self.id(), "stopping virtual device");
        handle.cancel.cancel();
        while let Some(joined) = handle.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(device_id = %self.id(), "device task panicked: {e}");
                }
            }
        }

        self.inner.transition(DeviceStatus::Offline);
        *self.inner.run_started.lock() = None;
        self.inner.started.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("device_id", &self.inner.config.device_id)
            .field("profile", &self.inner.config.profile)
            .field("status", &self.status())
            .finish()
    }
}

impl DeviceInner {
    fn uptime(&self) -> Duration {
        let started = *self.run_started.lock();
        started.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn transition(&self, next: DeviceStatus) -> bool {
        let mut state = self.state.write();
        self.apply(&mut state, next)
    }

    fn transition_from(&self, expected: DeviceStatus, next: DeviceStatus) -> bool {
        let mut state = self.state.write();
        if state.status != expected {
            return false;
        }
        self.apply(&mut state, next)
    }

    fn apply(&self, state: &mut DeviceState, next: DeviceStatus) -> bool {
        let from = state.status;
        if from == next || !from.can_transition_to(next) {
            return false;
        }
        state.status = next;
        state.updating = next == DeviceStatus::Updating;

        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(StatusChange { from, to: next, at: Utc::now() });
        true
    }

    fn next_period(&self, base: Duration) -> Duration {
        jittered(base, self.config.jitter_percent, self.rng.as_ref())
    }
}

async fn telemetry_loop(inner: Arc<DeviceInner>, cancel: CancellationToken) {
    loop {
        if !sleep_or_cancel(&cancel, inner.next_period(inner.config.metrics_interval)).await {
            return;
        }
        if inner.limiter.acquire(&cancel).await.is_err() {
            return;
        }
        if inner.rng.chance(inner.config.error_rate) {
            debug!(device_id = %inner.config.device_id, "simulating metrics error");
            inner.state.write().error_count += 1;
            continue;
        }

        let metrics = inner.generator.lock().generate(inner.rng.as_ref(), inner.uptime());
        debug!(
            device_id = %inner.config.device_id,
            cpu_usage = metrics.cpu.usage_percent,
            memory_usage = metrics.memory.used_percent,
            "sending metrics"
        );
        let latency = inner.rng.duration_between(METRICS_SEND_LATENCY.0, METRICS_SEND_LATENCY.1);
        if !sleep_or_cancel(&cancel, latency).await {
            return;
        }
        inner.state.write().metrics_sent += 1;
        if let Some(observer) = &inner.observer {
            observer.metrics_sent(&inner.config.device_id);
        }
    }
}

async fn heartbeat_loop(inner: Arc<DeviceInner>, cancel: CancellationToken) {
    loop {
        if !sleep_or_cancel(&cancel, inner.next_period(inner.config.heartbeat_interval)).await {
            return;
        }
        if inner.limiter.acquire(&cancel).await.is_err() {
            return;
        }
        if inner.rng.chance(inner.config.error_rate) {
            debug!(device_id = %inner.config.device_id, "simulating heartbeat error");
            inner.state.write().error_count += 1;
            continue;
        }

        let latency = inner.rng.duration_between(HEARTBEAT_SEND_LATENCY.0, HEARTBEAT_SEND_LATENCY.1);
        if !sleep_or_cancel(&cancel, latency).await {
            return;
        }
        {
            let mut state = inner.state.write();
            state.messages_sent += 1;
            state.last_seen = Some(Utc::now());
        }
        if let Some(observer) = &inner.observer {
            observer.heartbeat_sent(&inner.config.device_id);
        }
    }
}

async fn state_loop(inner: Arc<DeviceInner>, cancel: CancellationToken) {
    let period = inner.config.state_check_interval.max(MIN_CHECK_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !inner.rng.chance(inner.config.transition_probability) {
            continue;
        }
        let next = match inner.state.read().status {
            DeviceStatus::Online if inner.rng.chance(0.5) => DeviceStatus::Updating,
            DeviceStatus::Online => DeviceStatus::Maintenance,
            DeviceStatus::Updating | DeviceStatus::Maintenance => DeviceStatus::Online,
            _ => continue,
        };
        if inner.transition(next) {
            debug!(device_id = %inner.config.device_id, status = %next, "spontaneous state change");
        }
    }
}

async fn fault_loop(inner: Arc<DeviceInner>, cancel: CancellationToken) {
    let period = inner.config.fault_check_interval.max(MIN_CHECK_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !inner.rng.chance(inner.config.fault_probability) {
            continue;
        }
        if !inner.transition_from(DeviceStatus::Online, DeviceStatus::Error) {
            continue;
        }
        warn!(device_id = %inner.config.device_id, "simulating temporary error condition");

        let recovery = inner.rng.duration_between(FAULT_RECOVERY.0, FAULT_RECOVERY.1);
        if !sleep_or_cancel(&cancel, recovery).await {
            return;
        }
        if inner.transition_from(DeviceStatus::Error, DeviceStatus::Online) {
            debug!(device_id = %inner.config.device_id, after = ?recovery, "recovered from error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{FixedRandom, ThreadRandom};

    fn fast_config(profile: DeviceProfile) -> DeviceConfig {
        DeviceConfig::for_profile(profile, uuid::Uuid::new_v4().to_string())
            .with_intervals(Duration::from_millis(100), Duration::from_millis(200))
            .with_check_intervals(Duration::from_millis(50), Duration::from_millis(50))
    }

    fn quiet_device(config: DeviceConfig) -> VirtualDevice {
        // 0.99 : aucune erreur, aucune transition spontanée
        VirtualDevice::new(config, Arc::new(FixedRandom::new(0.99)), CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_lifecycle() {
        let device = quiet_device(fast_config(DeviceProfile::Full));
        assert_eq!(device.status(), DeviceStatus::Offline);
        assert!(!device.is_started());

        device.start().await.unwrap();
        assert!(device.is_started());
        assert_eq!(device.status(), DeviceStatus::Online);
        assert!(device.state().registered);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = device.state();
        assert!(state.metrics_sent > 0);
        assert!(state.messages_sent > 0);
        assert_eq!(state.error_count, 0);
        assert!(state.last_seen.is_some());
        assert!(state.uptime >= Duration::from_secs(2));

        device.stop().await;
        assert_eq!(device.status(), DeviceStatus::Offline);
        assert!(!device.is_started());
    }

    #[derive(Default)]
    struct Tally {
        registered: std::sync::atomic::AtomicU64,
        metrics: std::sync::atomic::AtomicU64,
        heartbeats: std::sync::atomic::AtomicU64,
    }

    impl DeviceObserver for Tally {
        fn registered(&self, _device_id: &str, _profile: DeviceProfile) {
            self.registered.fetch_add(1, Ordering::Relaxed);
        }
        fn metrics_sent(&self, _device_id: &str) {
            self.metrics.fetch_add(1, Ordering::Relaxed);
        }
        fn heartbeat_sent(&self, _device_id: &str) {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_registration_once_and_every_send() {
        let tally = Arc::new(Tally::default());
        let device = VirtualDevice::observed(
            fast_config(DeviceProfile::Full),
            Arc::new(FixedRandom::new(0.99)),
            CancellationToken::new(),
            tally.clone(),
        );
        for _ in 0..2 {
            device.start().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            device.stop().await;
        }

        let state = device.state();
        assert_eq!(tally.registered.load(Ordering::Relaxed), 1);
        assert_eq!(tally.metrics.load(Ordering::Relaxed), state.metrics_sent);
        assert_eq!(tally.heartbeats.load(Ordering::Relaxed), state.messages_sent);
        assert!(state.metrics_sent > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_fails() {
        let device = quiet_device(fast_config(DeviceProfile::Minimal));
        device.start().await.unwrap();
        let err = device.start().await.unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyStarted(_)));
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let device = quiet_device(fast_config(DeviceProfile::Constrained));
        device.stop().await;
        device.start().await.unwrap();
        device.stop().await;
        let history_len = device.status_history().len();
        device.stop().await;
        assert_eq!(device.status_history().len(), history_len);
        assert_eq!(device.status(), DeviceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_keeps_counters() {
        let device = quiet_device(fast_config(DeviceProfile::Full));
        device.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        device.stop().await;
        let sent = device.state().metrics_sent;

        device.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(device.state().metrics_sent > sent);
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_counted_not_sent() {
        let config = fast_config(DeviceProfile::Full).with_error_rate(1.0);
        let device = quiet_device(config);
        device.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = device.state();
        assert!(state.error_count > 0);
        assert_eq!(state.metrics_sent, 0);
        assert_eq!(state.messages_sent, 0);
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_reaches_device() {
        let parent = CancellationToken::new();
        let device = VirtualDevice::new(fast_config(DeviceProfile::Full), Arc::new(FixedRandom::new(0.99)), parent.clone());
        device.start().await.unwrap();
        parent.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = device.state().metrics_sent;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(device.state().metrics_sent, sent);
        device.stop().await;
        assert!(matches!(device.start().await, Err(DeviceError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_sequence_follows_state_machine() {
        let config = fast_config(DeviceProfile::Constrained).with_fault_model(0.5, 0.3);
        let device = VirtualDevice::new(config, Arc::new(ThreadRandom), CancellationToken::new());
        for _ in 0..3 {
            device.start().await.unwrap();
            tokio::time::sleep(Duration::from_secs(20)).await;
            device.stop().await;
        }

        let history = device.status_history();
        assert!(history.len() > 6);
        for change in &history {
            assert!(change.from.can_transition_to(change.to), "{:?} -> {:?}", change.from, change.to);
            assert!(!(change.from == DeviceStatus::Offline && change.to == DeviceStatus::Updating));
        }
        for pair in history.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[tokio::test]
    async fn test_external_status_is_guarded() {
        let device = quiet_device(fast_config(DeviceProfile::Full));
        assert!(!device.set_status(DeviceStatus::Updating));
        device.start().await.unwrap();
        assert!(device.set_status(DeviceStatus::Updating));
        assert!(!device.set_status(DeviceStatus::Maintenance));
        assert!(device.set_status(DeviceStatus::Online));
        device.stop().await;
    }
}
