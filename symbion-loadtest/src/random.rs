//! Injectable randomness
//!
//! Every probability-driven outcome in the simulator (error injection,
//! jitter, update success, reconnection success) draws from a
//! `RandomSource`. Production code uses `ThreadRandom`; tests plug in
//! `FixedRandom` or `SequenceRandom` to force outcomes.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub type SharedRandom = Arc<dyn RandomSource>;

pub trait RandomSource: Send + Sync {
    /// Uniform draw in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// Bernoulli trial.
    fn chance(&self, probability: f64) -> bool {
        self.next_f64() < probability
    }

    /// Uniform draw in `[low, high)`.
    fn between(&self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Uniform duration in `[low, high)`.
    fn duration_between(&self, low: Duration, high: Duration) -> Duration {
        let secs = self.between(low.as_secs_f64(), high.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Thread-local generator seeded from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(f64);

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 0.999_999))
    }
}

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Replays a scripted sequence, then falls back to a constant.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl SequenceRandom {
    pub fn new(values: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            fallback,
        }
    }

    pub fn remaining(&self) -> usize {
        self.values.lock().len()
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        self.values.lock().pop_front().unwrap_or(self.fallback)
    }
}

pub fn thread_random() -> SharedRandom {
    Arc::new(ThreadRandom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_random_in_unit_interval() {
        let rng = ThreadRandom;
        for _ in 0..1000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_fixed_random_forces_chance() {
        let low = FixedRandom::new(0.0);
        let high = FixedRandom::new(1.0);
        assert!(low.chance(0.01));
        assert!(!high.chance(1.0 - 1e-3));
        assert!(high.chance(1.0));
    }

    #[test]
    fn test_sequence_then_fallback() {
        let rng = SequenceRandom::new([0.1, 0.9], 0.5);
        assert_eq!(rng.next_f64(), 0.1);
        assert_eq!(rng.next_f64(), 0.9);
        assert_eq!(rng.remaining(), 0);
        assert_eq!(rng.next_f64(), 0.5);
    }

    #[test]
    fn test_duration_between_bounds() {
        let rng = FixedRandom::new(0.5);
        let d = rng.duration_between(Duration::from_secs(10), Duration::from_secs(20));
        assert_eq!(d, Duration::from_secs(15));
    }
}
