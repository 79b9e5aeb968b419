//! Repair sessions: lifecycle states, budgets and terminal outcomes.
//!
//! A [`Session`] is owned by the repair state machine and mutated only
//! through the crate-private transition functions below. Callers outside
//! the crate observe it through getters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::error::{ErrorKind, PatcherError, Result};
use super::risk::ApprovalStatus;

/// States of the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ingest,
    Plan,
    Patch,
    Test,
    Repair,
    Pr,
    Done,
    Failed,
    Escalated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Escalated)
    }

    /// Whether `self -> next` is a legal edge of the repair loop.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Escalated) => true,
            (Ingest, Plan) | (Ingest, Done) => true,
            (Plan, Patch) => true,
            (Patch, Test) => true,
            // The approved patch set could not be applied to the files on disk.
            (Patch, Repair) => true,
            (Test, Pr) | (Test, Repair) => true,
            (Repair, Plan) => true,
            (Pr, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ingest => "INGEST",
            Self::Plan => "PLAN",
            Self::Patch => "PATCH",
            Self::Test => "TEST",
            Self::Repair => "REPAIR",
            Self::Pr => "PR",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Escalated => "ESCALATED",
        };
        f.write_str(name)
    }
}

/// Which budget a session ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Iterations,
    Cost,
    Time,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iterations => write!(f, "iteration"),
            Self::Cost => write!(f, "cost"),
            Self::Time => write!(f, "time"),
        }
    }
}

/// Hard limits for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    /// Maximum number of REPAIR -> PLAN transitions.
    pub max_iterations: u32,
    pub max_cost_usd: f64,
    pub max_duration_secs: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_cost_usd: 5.0,
            max_duration_secs: 600,
        }
    }
}

/// Terminal status reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Done,
    Escalated,
    Failed,
}

impl TerminalStatus {
    pub fn state(self) -> SessionState {
        match self {
            Self::Done => SessionState::Done,
            Self::Escalated => SessionState::Escalated,
            Self::Failed => SessionState::Failed,
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state().fmt(f)
    }
}

/// Structured reason attached to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OutcomeReason {
    AllTestsPass,
    NothingToRepair,
    BudgetExceeded {
        budget: BudgetKind,
        used: String,
        limit: String,
    },
    NoProgress {
        consecutive_iterations: u32,
        failing_tests: Vec<String>,
    },
    SafetyGate {
        status: ApprovalStatus,
        rules: Vec<String>,
    },
    /// The planner had nothing left to propose.
    NoFixFound {
        planner: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl OutcomeReason {
    pub fn from_error(err: &PatcherError) -> Self {
        match err {
            PatcherError::BudgetExceeded { kind, used, limit } => Self::BudgetExceeded {
                budget: *kind,
                used: used.clone(),
                limit: limit.clone(),
            },
            PatcherError::SafetyViolation { status, rules } => Self::SafetyGate {
                status: *status,
                rules: rules.clone(),
            },
            other => Self::Error {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

/// Final verdict of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutcome {
    pub status: TerminalStatus,
    #[serde(flatten)]
    pub reason: OutcomeReason,
    /// Patches reverted before the outcome was reported.
    #[serde(default)]
    pub rolled_back_patches: u32,
    pub reached_at: DateTime<Utc>,
}

impl TerminalOutcome {
    pub fn new(status: TerminalStatus, reason: OutcomeReason) -> Self {
        Self {
            status,
            reason,
            rolled_back_patches: 0,
            reached_at: Utc::now(),
        }
    }

    pub fn done(reason: OutcomeReason) -> Self {
        Self::new(TerminalStatus::Done, reason)
    }

    pub fn escalated(reason: OutcomeReason) -> Self {
        Self::new(TerminalStatus::Escalated, reason)
    }

    pub fn from_error(err: &PatcherError) -> Self {
        Self::new(err.terminal_status(), OutcomeReason::from_error(err))
    }
}

/// Audit record of one state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

/// One end-to-end attempt to repair a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: Uuid,
    repo_path: PathBuf,
    state: SessionState,
    iteration_count: u32,
    started_at: DateTime<Utc>,
    accumulated_cost_usd: f64,
    elapsed_ms: u64,
    budgets: Budgets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<TerminalOutcome>,
    #[serde(default)]
    transitions: Vec<TransitionRecord>,
}

impl Session {
    pub fn new(repo_path: impl Into<PathBuf>, budgets: Budgets) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_path: repo_path.into(),
            state: SessionState::Ingest,
            iteration_count: 0,
            started_at: Utc::now(),
            accumulated_cost_usd: 0.0,
            elapsed_ms: 0,
            budgets,
            outcome: None,
            transitions: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn accumulated_cost_usd(&self) -> f64 {
        self.accumulated_cost_usd
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.as_ref()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Number of times the session entered `state`.
    pub fn visits(&self, state: SessionState) -> usize {
        self.transitions.iter().filter(|t| t.to == state).count()
    }

    pub(crate) fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(PatcherError::unrecoverable(format!(
                "illegal transition {} -> {}",
                self.state, to
            )));
        }
        self.transitions.push(TransitionRecord {
            from: self.state,
            to,
            iteration: self.iteration_count,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    pub(crate) fn terminate(&mut self, outcome: TerminalOutcome) -> Result<()> {
        self.transition(outcome.status.state())?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Re-enter a non-terminal state after loading a snapshot.
    pub(crate) fn resume_at(&mut self, state: SessionState) {
        if !self.state.is_terminal() && !state.is_terminal() {
            self.state = state;
        }
    }

    /// Add spend; negative or non-finite amounts are ignored so cost never decreases.
    pub(crate) fn add_cost(&mut self, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            self.accumulated_cost_usd += usd;
        }
    }

    /// Record total elapsed time; earlier readings never overwrite later ones.
    pub(crate) fn record_elapsed(&mut self, elapsed_ms: u64) {
        self.elapsed_ms = self.elapsed_ms.max(elapsed_ms);
    }

    pub(crate) fn begin_iteration(&mut self) -> Result<()> {
        if self.iteration_count >= self.budgets.max_iterations {
            return Err(self.iteration_budget_error());
        }
        self.iteration_count += 1;
        Ok(())
    }

    pub fn iterations_remaining(&self) -> u32 {
        self.budgets.max_iterations.saturating_sub(self.iteration_count)
    }

    pub(crate) fn iteration_budget_error(&self) -> PatcherError {
        PatcherError::BudgetExceeded {
            kind: BudgetKind::Iterations,
            used: self.iteration_count.to_string(),
            limit: self.budgets.max_iterations.to_string(),
        }
    }

    /// Cost and time checks evaluated at every transition boundary.
    pub fn check_budgets(&self) -> Result<()> {
        if self.accumulated_cost_usd >= self.budgets.max_cost_usd {
            return Err(PatcherError::BudgetExceeded {
                kind: BudgetKind::Cost,
                used: format!("{:.4}", self.accumulated_cost_usd),
                limit: format!("{:.4}", self.budgets.max_cost_usd),
            });
        }
        let limit_ms = self.budgets.max_duration_secs.saturating_mul(1000);
        if self.elapsed_ms >= limit_ms {
            return Err(PatcherError::BudgetExceeded {
                kind: BudgetKind::Time,
                used: format!("{}ms", self.elapsed_ms),
                limit: format!("{limit_ms}ms"),
            });
        }
        Ok(())
    }
}
