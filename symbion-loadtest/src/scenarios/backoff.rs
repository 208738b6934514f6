//! Reconnection backoff

use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential delay calculator: `base * 2^(attempt-1)`, capped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), multiplier: 2.0 }
    }

    /// Délai d'attente après l'échec de la tentative `attempt` (1-indexée)
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.min(63) as i32 - 1);
        let nanos = self.base.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Infinite iterator over successive delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1u32..).map(move |attempt| self.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let backoff = ReconnectBackoff::default();
        let delays: Vec<_> = backoff.delays().take(6).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_monotonic_and_bounded() {
        let backoff = ReconnectBackoff::new(Duration::from_millis(150), Duration::from_secs(7));
        let delays: Vec<_> = backoff.delays().take(200).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(7)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
    }
}
