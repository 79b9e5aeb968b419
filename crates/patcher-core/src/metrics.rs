//! Process-wide atomic counters for repair sessions.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as one `tracing::info!` event,
//! typically when a session finishes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::TerminalStatus;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    sessions_started: AtomicU64,
    sessions_done: AtomicU64,
    sessions_escalated: AtomicU64,
    sessions_failed: AtomicU64,
    transitions: AtomicU64,
    patches_applied: AtomicU64,
    patches_rolled_back: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_done: AtomicU64::new(0),
            sessions_escalated: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            patches_rolled_back: AtomicU64::new(0),
        }
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_started", "counter incremented");
    }

    /// Count a session that reached `status`.
    pub fn inc_finished(&self, status: TerminalStatus) {
        let (counter, name) = match status {
            TerminalStatus::Done => (&self.sessions_done, "sessions_done"),
            TerminalStatus::Escalated => (&self.sessions_escalated, "sessions_escalated"),
            TerminalStatus::Failed => (&self.sessions_failed, "sessions_failed"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_transitions(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transitions", "counter incremented");
    }

    pub fn inc_patches_applied(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patches_applied", "counter incremented");
    }

    pub fn add_patches_rolled_back(&self, count: u64) {
        self.patches_rolled_back.fetch_add(count, Ordering::Relaxed);
        tracing::trace!(metric = "patches_rolled_back", count, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sessions_started = self.sessions_started(),
            sessions_done = self.sessions_done(),
            sessions_escalated = self.sessions_escalated(),
            sessions_failed = self.sessions_failed(),
            transitions = self.transitions(),
            patches_applied = self.patches_applied(),
            patches_rolled_back = self.patches_rolled_back(),
        );
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_done(&self) -> u64 {
        self.sessions_done.load(Ordering::Relaxed)
    }

    pub fn sessions_escalated(&self) -> u64 {
        self.sessions_escalated.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn patches_rolled_back(&self) -> u64 {
        self.patches_rolled_back.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.sessions_started,
            &self.sessions_done,
            &self.sessions_escalated,
            &self.sessions_failed,
            &self.transitions,
            &self.patches_applied,
            &self.patches_rolled_back,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.inc_sessions_started();
        m.inc_sessions_started();
        assert_eq!(m.sessions_started(), 2);

        m.inc_finished(TerminalStatus::Done);
        m.inc_finished(TerminalStatus::Escalated);
        m.inc_finished(TerminalStatus::Escalated);
        assert_eq!(m.sessions_done(), 1);
        assert_eq!(m.sessions_escalated(), 2);
        assert_eq!(m.sessions_failed(), 0);

        m.inc_patches_applied();
        m.add_patches_rolled_back(3);
        assert_eq!(m.patches_applied(), 1);
        assert_eq!(m.patches_rolled_back(), 3);
    }

    #[test]
    fn test_reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_sessions_started();
        m.inc_transitions();
        m.inc_finished(TerminalStatus::Failed);
        m.reset();
        assert_eq!(m.sessions_started(), 0);
        assert_eq!(m.transitions(), 0);
        assert_eq!(m.sessions_failed(), 0);
    }
}
