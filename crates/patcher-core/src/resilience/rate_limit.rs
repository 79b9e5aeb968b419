//! Token bucket plus sliding per-minute and per-hour windows.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Burst size of the token bucket.
    pub bucket_capacity: u32,
    /// Tokens added back per minute.
    pub refill_per_minute: u32,
    /// Longest a blocking caller waits for capacity before giving up.
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 3600,
            bucket_capacity: 10,
            refill_per_minute: 10,
            max_wait_ms: 120_000,
        }
    }
}

/// Admission control for outbound backend calls.
///
/// A request is admitted only when the bucket holds a whole token and both
/// sliding windows have room. Rejections report how long until all three
/// would admit.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.bucket_capacity),
            last_refill: now,
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill_rate_per_sec(&self) -> f64 {
        f64::from(self.config.refill_per_minute) / 60.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(self.config.bucket_capacity);
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec()).min(capacity);
        self.last_refill = now;
    }

    fn prune(window: &mut VecDeque<Instant>, span: Duration, now: Instant) {
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wait until a full window has room, or zero if it already does.
    fn window_wait(window: &VecDeque<Instant>, limit: u32, span: Duration, now: Instant) -> Duration {
        // A zero limit admits nothing.
        if limit == 0 {
            return Duration::MAX;
        }
        if (window.len() as u64) < u64::from(limit) {
            return Duration::ZERO;
        }
        let excess = window.len() + 1 - limit as usize;
        window
            .get(excess - 1)
            .map(|&t| (t + span).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn bucket_wait(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let rate = self.refill_rate_per_sec();
        if rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / rate)
    }

    /// Take one slot, or report the time until one frees up.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        Self::prune(&mut self.minute, MINUTE, now);
        Self::prune(&mut self.hour, HOUR, now);

        let wait = self
            .bucket_wait()
            .max(Self::window_wait(&self.minute, self.config.requests_per_minute, MINUTE, now))
            .max(Self::window_wait(&self.hour, self.config.requests_per_hour, HOUR, now));
        if !wait.is_zero() {
            return Err(wait);
        }

        self.tokens -= 1.0;
        self.minute.push_back(now);
        self.hour.push_back(now);
        Ok(())
    }

    /// Whole tokens currently in the bucket.
    pub fn available_tokens(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    /// Requests admitted in the trailing minute and hour.
    pub fn window_counts(&mut self, now: Instant) -> (usize, usize) {
        Self::prune(&mut self.minute, MINUTE, now);
        Self::prune(&mut self.hour, HOUR, now);
        (self.minute.len(), self.hour.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Instant) {
        let now = Instant::now();
        (RateLimiter::new(config, now), now)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_refills() {
        let (mut rl, t0) = limiter(RateLimitConfig {
            bucket_capacity: 3,
            refill_per_minute: 60,
            ..RateLimitConfig::default()
        });
        for _ in 0..3 {
            assert!(rl.try_acquire(t0).is_ok());
        }
        let wait = rl.try_acquire(t0).expect_err("bucket empty");
        assert_eq!(wait, Duration::from_secs(1));

        assert!(rl.try_acquire(t0 + Duration::from_secs(1)).is_ok());
        assert!(rl.try_acquire(t0 + Duration::from_secs(1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_caps_requests() {
        let (mut rl, t0) = limiter(RateLimitConfig {
            requests_per_minute: 2,
            bucket_capacity: 100,
            refill_per_minute: 6000,
            ..RateLimitConfig::default()
        });
        assert!(rl.try_acquire(t0).is_ok());
        assert!(rl.try_acquire(t0 + Duration::from_secs(10)).is_ok());
        let wait = rl
            .try_acquire(t0 + Duration::from_secs(20))
            .expect_err("window full");
        assert_eq!(wait, Duration::from_secs(40));
        assert!(rl.try_acquire(t0 + Duration::from_secs(60)).is_ok());
        assert_eq!(rl.window_counts(t0 + Duration::from_secs(60)), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_window_caps_requests() {
        let (mut rl, t0) = limiter(RateLimitConfig {
            requests_per_minute: 100,
            requests_per_hour: 3,
            bucket_capacity: 100,
            refill_per_minute: 6000,
            ..RateLimitConfig::default()
        });
        for i in 0..3 {
            assert!(rl.try_acquire(t0 + Duration::from_secs(i * 120)).is_ok());
        }
        let wait = rl
            .try_acquire(t0 + Duration::from_secs(600))
            .expect_err("hourly cap");
        assert_eq!(wait, Duration::from_secs(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_consumes_nothing() {
        let (mut rl, t0) = limiter(RateLimitConfig {
            bucket_capacity: 1,
            refill_per_minute: 60,
            ..RateLimitConfig::default()
        });
        assert!(rl.try_acquire(t0).is_ok());
        assert!(rl.try_acquire(t0).is_err());
        assert!(rl.try_acquire(t0).is_err());
        assert_eq!(rl.window_counts(t0), (1, 1));
        assert!(rl.try_acquire(t0 + Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_limit_admits_nothing() {
        let (mut rl, t0) = limiter(RateLimitConfig {
            requests_per_minute: 0,
            ..RateLimitConfig::default()
        });
        assert_eq!(rl.try_acquire(t0), Err(Duration::MAX));
        assert_eq!(rl.window_counts(t0), (0, 0));
    }
}
