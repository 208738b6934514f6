//! Cancellable waits shared by devices, fleet and scenarios

use crate::random::RandomSource;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Floor applied to jittered periods so a zero interval never spins.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// `d + d * jitter * (r - 0.5) * 2`, never below 1ms.
pub fn jittered(duration: Duration, jitter_percent: f64, rng: &dyn RandomSource) -> Duration {
    let base = duration.as_secs_f64();
    let offset = base * jitter_percent * (rng.next_f64() - 0.5) * 2.0;
    Duration::from_secs_f64((base + offset).max(0.0)).max(MIN_PERIOD)
}
