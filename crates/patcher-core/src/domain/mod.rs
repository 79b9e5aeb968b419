//! Domain models for repair sessions.
//!
//! Canonical definitions for the core entities:
//! - `Session`: one budgeted repair attempt and its terminal outcome
//! - `FixPlan`: immutable plan produced by the PLAN phase
//! - `CodePatch` / `PatchSet`: modifications proposed for one PATCH attempt
//! - `RiskAssessment`: safety verdict for a patch set
//! - `TestExecutionResult`: normalized output of one TEST run

pub mod error;
pub mod patch;
pub mod phase;
pub mod plan;
pub mod risk;
pub mod session;
pub mod test_result;

pub use error::{ErrorKind, PatcherError, Result, TestRunnerErrorKind};
pub use patch::{CodePatch, Modification, ModificationKind, PatchSet};
pub use phase::PhaseOutcome;
pub use plan::{ChangeType, FixPlan, PlanDraft, PlanStep};
pub use risk::{ApprovalStatus, FileRisk, RiskAssessment, RiskLevel, RuleKind, TriggeredRule};
pub use session::{
    BudgetKind, Budgets, OutcomeReason, Session, SessionState, TerminalOutcome, TerminalStatus,
    TransitionRecord,
};
pub use test_result::{FailureKind, TestExecutionResult, TestFailure, TestFramework};
