//! Three-state circuit breaker.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single half-open probe.
    Trial,
}

/// Opens after `failure_threshold` consecutive failures and fails fast
/// until the cool-down elapses. Then exactly one trial call is admitted:
/// success closes the circuit, failure reopens it with a fresh cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    /// State as of `now`, promoting an expired open circuit to half-open.
    pub fn state(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if now.saturating_duration_since(opened) >= self.cooldown() {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
        self.state
    }

    /// Last recorded state without advancing the clock.
    pub fn current_state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Admit a call, or report how long until the next trial is allowed.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Permit, Duration> {
        match self.state(now) {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let until = self
                    .opened_at
                    .map(|opened| (opened + self.cooldown()).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);
                Err(until)
            }
            CircuitState::HalfOpen if self.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(Permit::Trial)
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    /// Count a failure. Returns true when this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let opens = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if opens {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            self.trial_in_flight = false;
        }
        opens
    }

    /// Give back a trial permit whose call ended without a health verdict.
    pub fn release(&mut self, permit: Permit) {
        if permit == Permit::Trial {
            self.trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_secs: 30,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_starts_closed() {
        let mut cb = breaker(5);
        assert_eq!(cb.state(Instant::now()), CircuitState::Closed);
        assert_eq!(cb.try_acquire(Instant::now()), Ok(Permit::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_fails_fast() {
        let mut cb = breaker(5);
        let t0 = Instant::now();
        for _ in 0..4 {
            assert!(!cb.record_failure(t0));
        }
        assert_eq!(cb.state(t0), CircuitState::Closed);
        assert!(cb.record_failure(t0));
        assert_eq!(cb.state(t0), CircuitState::Open);

        let wait = cb
            .try_acquire(t0 + Duration::from_secs(10))
            .expect_err("open circuit fails fast");
        assert_eq!(wait, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let mut cb = breaker(1);
        let t0 = Instant::now();
        cb.record_failure(t0);
        let later = t0 + Duration::from_secs(30);
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire(later), Ok(Permit::Trial));
        assert!(cb.try_acquire(later).is_err(), "only one trial at a time");

        cb.record_success();
        assert_eq!(cb.state(later), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_resets_cooldown() {
        let mut cb = breaker(1);
        let t0 = Instant::now();
        cb.record_failure(t0);
        let trial_at = t0 + Duration::from_secs(31);
        assert_eq!(cb.try_acquire(trial_at), Ok(Permit::Trial));
        assert!(cb.record_failure(trial_at));
        assert_eq!(cb.state(trial_at), CircuitState::Open);

        // Cool-down counts from the failed trial, not the first opening.
        assert_eq!(cb.state(t0 + Duration::from_secs(60)), CircuitState::Open);
        assert_eq!(
            cb.state(trial_at + Duration::from_secs(30)),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let mut cb = breaker(3);
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        cb.record_success();
        cb.record_failure(t0);
        cb.record_failure(t0);
        assert_eq!(cb.state(t0), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_trial_slot() {
        let mut cb = breaker(1);
        let t0 = Instant::now();
        cb.record_failure(t0);
        let later = t0 + Duration::from_secs(30);
        let permit = cb.try_acquire(later).expect("trial");
        cb.release(permit);
        assert_eq!(cb.try_acquire(later), Ok(Permit::Trial));
    }
}
