//! Per-device request ceiling (token bucket)

use crate::error::DeviceError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }
}

impl RateLimiter {
    /// Burst = débit : un device peut consommer une seconde de budget d'un coup.
    pub fn new(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: rate,
                last_refill: Instant::now(),
                max_tokens: rate,
                refill_rate: rate,
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_consume().is_ok()
    }

    /// Attend un jeton ; abandonne dès que `cancel` est déclenché.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), DeviceError> {
        loop {
            let wait = match self.bucket.lock().try_consume() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        let cancel = CancellationToken::new();
        let before = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_cancellable() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(limiter.acquire(&cancel).await, Err(DeviceError::Cancelled)));
    }
}
