//! Per-client resilience counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::circuit::CircuitState;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limited: AtomicU64,
    retries: AtomicU64,
    schema_retries: AtomicU64,
    fail_fast: AtomicU64,
    circuit_opened: AtomicU64,
    backend_calls: AtomicU64,
}

impl Counters {
    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_schema_retry(&self) {
        self.schema_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fail_fast(&self) {
        self.fail_fast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_circuit_opened(&self) {
        self.circuit_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_call(&self) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, circuit_state: CircuitState) -> ResilienceStats {
        ResilienceStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            schema_retries: self.schema_retries.load(Ordering::Relaxed),
            fail_fast: self.fail_fast.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            circuit_state,
        }
    }
}

/// Point-in-time view of a client's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Calls rejected or deferred past their wait limit by the rate limiter.
    pub rate_limited: u64,
    pub retries: u64,
    /// Corrective retries after schema validation failures.
    pub schema_retries: u64,
    /// Calls refused because the circuit was open.
    pub fail_fast: u64,
    pub circuit_opened: u64,
    /// Requests that actually reached the backend.
    pub backend_calls: u64,
    pub circuit_state: CircuitState,
}

impl ResilienceStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let c = Counters::default();
        c.inc_cache_hit();
        c.inc_cache_hit();
        c.inc_cache_miss();
        c.inc_retry();
        let s = c.snapshot(CircuitState::Closed);
        assert_eq!(s.cache_hits, 2);
        assert_eq!(s.cache_misses, 1);
        assert_eq!(s.retries, 1);
        assert!((s.cache_hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_serialize_circuit_state() {
        let s = Counters::default().snapshot(CircuitState::HalfOpen);
        let json = serde_json::to_value(&s).expect("serialize");
        assert_eq!(json["circuit_state"], "half_open");
        assert_eq!(s.cache_hit_rate(), 0.0);
    }
}
