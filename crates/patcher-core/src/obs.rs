//! Structured observability hooks for repair-session lifecycle events.
//!
//! This module provides:
//! - Session-scoped tracing spans via the `SessionSpan` guard
//! - Emission functions for lifecycle events: start, transition, risk
//!   assessment, patch apply/rollback, finish
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use std::path::Path;

use tracing::{info, Instrument};
use uuid::Uuid;

use crate::domain::{RiskAssessment, SessionState, TerminalOutcome};

/// Span tagged with a session id.
///
/// Holds the span rather than an entered guard so that it can wrap an
/// async session loop via [`SessionSpan::instrument`].
///
/// ```ignore
/// let span = SessionSpan::new(session.id(), repo);
/// span.instrument(machine.run()).await;
/// ```
#[derive(Debug, Clone)]
pub struct SessionSpan {
    span: tracing::Span,
}

impl SessionSpan {
    pub fn new(session_id: Uuid, repo: &Path) -> Self {
        let span = tracing::info_span!(
            "patcher.session",
            session_id = %session_id,
            repo = %repo.display(),
        );
        Self { span }
    }

    /// Enter the span for synchronous work; exits when the guard drops.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn instrument<F: std::future::Future>(&self, fut: F) -> tracing::instrument::Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

pub fn emit_session_started(session_id: Uuid, repo: &Path, resumed: bool) {
    info!(
        event = "session.started",
        session_id = %session_id,
        repo = %repo.display(),
        resumed = resumed,
    );
}

/// Emit event: state transition with the iteration it happened in.
pub fn emit_session_transition(session_id: Uuid, from: SessionState, to: SessionState, iteration: u32) {
    info!(
        event = "session.transition",
        session_id = %session_id,
        from = %from,
        to = %to,
        iteration = iteration,
    );
}

/// Emit event: a patch set was assessed by the safety engine.
pub fn emit_risk_assessed(session_id: Uuid, assessment: &RiskAssessment) {
    info!(
        event = "risk.assessed",
        session_id = %session_id,
        patch_set = %assessment.patch_set_id,
        level = %assessment.level,
        status = %assessment.status,
        changed_lines = assessment.total_changed_lines,
        rules = assessment.rules.len(),
    );
}

pub fn emit_patch_applied(session_id: Uuid, patch_set_id: Uuid, files: usize) {
    info!(
        event = "patch.applied",
        session_id = %session_id,
        patch_set = %patch_set_id,
        files = files,
    );
}

pub fn emit_patch_rolled_back(session_id: Uuid, patch_set_id: Uuid, reason: &str) {
    info!(
        event = "patch.rolled_back",
        session_id = %session_id,
        patch_set = %patch_set_id,
        reason = %reason,
    );
}

/// Emit event: session reached a terminal state.
pub fn emit_session_finished(
    session_id: Uuid,
    outcome: &TerminalOutcome,
    iterations: u32,
    cost_usd: f64,
    elapsed_ms: u64,
) {
    let reason = serde_json::to_value(&outcome.reason)
        .ok()
        .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string))
        .unwrap_or_default();
    info!(
        event = "session.finished",
        session_id = %session_id,
        status = %outcome.status,
        reason = %reason,
        iterations = iterations,
        cost_usd = cost_usd,
        elapsed_ms = elapsed_ms,
        rolled_back = outcome.rolled_back_patches,
    );
}

/// Emit event: a snapshot could not be written (warning level).
pub fn emit_snapshot_error(session_id: Uuid, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "session.snapshot_error", session_id = %session_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::{emit_session_started, Path, SessionSpan, Uuid};

    #[test]
    fn test_session_span_create() {
        let span = SessionSpan::new(Uuid::new_v4(), Path::new("/tmp/repo"));
        let _guard = span.enter();
        emit_session_started(Uuid::new_v4(), Path::new("/tmp/repo"), false);
    }

    #[tokio::test]
    async fn test_session_span_instruments_future() {
        let span = SessionSpan::new(Uuid::new_v4(), Path::new("/tmp/repo"));
        let value = span.instrument(async { 7 }).await;
        assert_eq!(value, 7);
    }
}
