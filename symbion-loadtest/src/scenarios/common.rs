//! Building blocks shared by every scenario
//!
//! - Profile distribution with exact totals
//! - Per-second rates from cumulative counters
//! - Threshold violation accumulator
//! - Guaranteed fleet shutdown around a scenario body

use crate::device::DeviceProfile;
use crate::error::{FleetError, ScenarioError};
use crate::fleet::FleetSimulator;
use crate::timing::sleep_or_cancel;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Délai accordé à l'arrêt de la flotte avant annulation forcée
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Converts a percentage map into device counts summing exactly to `total`.
///
/// Each share is floored; the residual goes to the largest share (ties
/// resolved in `Full`, `Constrained`, `Minimal` order). Over-allocated maps
/// are trimmed starting from the largest share.
pub fn distribute_profiles(total: usize, percentages: &BTreeMap<DeviceProfile, f64>) -> BTreeMap<DeviceProfile, usize> {
    let shares: BTreeMap<DeviceProfile, f64> = percentages
        .iter()
        .map(|(profile, pct)| (*profile, if pct.is_finite() { pct.max(0.0) } else { 0.0 }))
        .collect();
    if shares.is_empty() {
        return BTreeMap::from([(DeviceProfile::Full, total)]);
    }

    let mut counts: BTreeMap<DeviceProfile, usize> = shares
        .iter()
        .map(|(profile, share)| (*profile, ((total as f64) * share).floor() as usize))
        .collect();

    // Ordre de priorité : plus grande part d'abord, puis ordre des profils
    let mut priority: Vec<DeviceProfile> = shares.keys().copied().collect();
    priority.sort_by(|a, b| shares[b].total_cmp(&shares[a]).then(a.cmp(b)));

    let assigned: usize = counts.values().sum();
    if assigned < total {
        if let Some(count) = counts.get_mut(&priority[0]) {
            *count += total - assigned;
        }
    } else {
        let mut excess = assigned - total;
        for profile in &priority {
            if excess == 0 {
                break;
            }
            if let Some(count) = counts.get_mut(profile) {
                let taken = excess.min(*count);
                *count -= taken;
                excess -= taken;
            }
        }
    }
    counts
}

/// Per-second deltas between consecutive samples of a cumulative counter
#[derive(Debug, Default, Clone)]
pub struct RateSampler {
    last: Option<(Instant, u64)>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate since the previous sample; `None` on the first sample.
    pub fn sample(&mut self, now: Instant, value: u64) -> Option<f64> {
        let previous = self.last.replace((now, value));
        let (then, before) = previous?;
        let elapsed = now.saturating_duration_since(then).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(value.saturating_sub(before) as f64 / elapsed)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Accumule les conditions en échec pour un seul message final
#[derive(Debug, Default)]
pub struct Violations(Vec<String>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    /// Records `violation()` when `failed` holds.
    pub fn check(&mut self, failed: bool, violation: impl FnOnce() -> String) {
        if failed {
            self.0.push(violation());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), ScenarioError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::ThresholdViolations(self.0))
        }
    }
}

/// Runs `body` then always stops `fleet`, forcing cancellation past the grace period.
pub async fn guarded<T, F>(fleet: &FleetSimulator, body: F) -> T
where
    F: Future<Output = T>,
{
    let outcome = body.await;
    if tokio::time::timeout(STOP_GRACE_PERIOD, fleet.stop()).await.is_err() {
        warn!(grace = ?STOP_GRACE_PERIOD, "fleet stop exceeded grace period, cancelling");
        fleet.cancel_token().cancel();
    }
    outcome
}

/// Démarre la flotte ; une annulation n'est pas une erreur d'infrastructure.
pub async fn start_fleet(fleet: &FleetSimulator, started: Instant) -> Result<(), ScenarioError> {
    match fleet.start().await {
        Ok(()) => Ok(()),
        Err(FleetError::Cancelled) => Err(ScenarioError::Cancelled(started.elapsed())),
        Err(e) => Err(ScenarioError::FleetStart(e)),
    }
}

/// Cancellable wait mapped onto `ScenarioError::Cancelled`.
pub async fn pause(cancel: &CancellationToken, duration: Duration, started: Instant) -> Result<(), ScenarioError> {
    if sleep_or_cancel(cancel, duration).await {
        Ok(())
    } else {
        Err(ScenarioError::Cancelled(started.elapsed()))
    }
}

pub(crate) fn percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{DeviceTiming, FleetConfig};
    use crate::random::FixedRandom;
    use std::sync::Arc;

    fn dist(full: f64, constrained: f64, minimal: f64) -> BTreeMap<DeviceProfile, f64> {
        BTreeMap::from([
            (DeviceProfile::Full, full),
            (DeviceProfile::Constrained, constrained),
            (DeviceProfile::Minimal, minimal),
        ])
    }

    #[test]
    fn test_distribution_sums_exactly() {
        for total in [0usize, 1, 7, 33, 99, 100, 1001, 9999] {
            for shares in [dist(0.3, 0.5, 0.2), dist(0.2, 0.5, 0.3), dist(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)] {
                let counts = distribute_profiles(total, &shares);
                assert_eq!(counts.values().sum::<usize>(), total, "total {total}");
            }
        }
    }

    #[test]
    fn test_residual_goes_to_largest_share() {
        let counts = distribute_profiles(33, &dist(0.3, 0.5, 0.2));
        // 9 + 16 + 6 = 31, reste 2 pour constrained
        assert_eq!(counts[&DeviceProfile::Full], 9);
        assert_eq!(counts[&DeviceProfile::Constrained], 18);
        assert_eq!(counts[&DeviceProfile::Minimal], 6);

        let tie = distribute_profiles(10, &dist(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0));
        assert_eq!(tie[&DeviceProfile::Full], 4);
    }

    #[test]
    fn test_out_of_range_percentages_corrected() {
        let over = distribute_profiles(10, &dist(1.0, 1.0, 1.0));
        assert_eq!(over.values().sum::<usize>(), 10);
        let under = distribute_profiles(10, &dist(0.1, 0.1, 0.1));
        assert_eq!(under.values().sum::<usize>(), 10);
        let negative = distribute_profiles(10, &dist(-0.5, f64::NAN, 0.5));
        assert_eq!(negative.values().sum::<usize>(), 10);
        assert_eq!(negative[&DeviceProfile::Minimal], 10);
        assert_eq!(distribute_profiles(5, &BTreeMap::new())[&DeviceProfile::Full], 5);
    }

    #[test]
    fn test_rate_sampler() {
        let t0 = Instant::now();
        let mut sampler = RateSampler::new();
        assert_eq!(sampler.sample(t0, 100), None);
        assert_eq!(sampler.sample(t0 + Duration::from_secs(2), 300), Some(100.0));
        assert_eq!(sampler.sample(t0 + Duration::from_secs(2), 400), None);
        sampler.reset();
        assert_eq!(sampler.sample(t0 + Duration::from_secs(3), 400), None);
    }

    #[test]
    fn test_violations_collect_all() {
        let mut v = Violations::new();
        assert!(v.is_empty());
        v.check(false, || "never".into());
        v.check(true, || "success rate too low".into());
        v.push("p95 too high");
        let err = v.into_result().unwrap_err();
        assert_eq!(err.violations().len(), 2);
        assert!(Violations::new().into_result().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_stops_fleet_on_error() {
        let config = FleetConfig::with_profiles(BTreeMap::from([(DeviceProfile::Full, 3)]))
            .with_timing(DeviceTiming::new(Duration::from_secs(1), Duration::from_secs(1)));
        let fleet = FleetSimulator::new(config).with_random(Arc::new(FixedRandom::new(0.99)));
        fleet.start().await.unwrap();

        let result: Result<(), ScenarioError> =
            guarded(&fleet, async { Err(ScenarioError::Config("boom".into())) }).await;
        assert!(result.is_err());
        assert_eq!(fleet.metrics().offline, 3);
        assert!(fleet.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_maps_cancellation() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert!(pause(&cancel, Duration::from_secs(1), started).await.is_ok());
        cancel.cancel();
        let err = pause(&cancel, Duration::from_secs(60), started).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Cancelled(d) if d >= Duration::from_secs(1)));
    }
}
