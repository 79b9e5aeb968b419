//! repo-patcher core library
//!
//! Drives a budgeted analyze → plan → patch → test → repair loop over a
//! repository with failing tests, gating every patch through a safety engine
//! and every backend call through a resilient client.

pub mod config;
pub mod context;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod repair;
pub mod resilience;
pub mod runtime;
pub mod safety;
pub mod snapshot;
pub mod telemetry;
pub mod workspace;

pub use config::{PatcherConfig, RepairConfig, RuntimeConfig};

pub use context::{CodeContext, FailureAnalysis, PatchOutcome, PatchRecord, SessionContext};

pub use domain::{
    ApprovalStatus, Budgets, CodePatch, ErrorKind, FixPlan, Modification, OutcomeReason,
    PatchSet, PatcherError, PhaseOutcome, Result, RiskAssessment, RiskLevel, Session,
    SessionState, TerminalOutcome, TerminalStatus, TestExecutionResult,
};

pub use repair::{
    BackendPlanner, ChangeSet, ImportFixPlanner, Planner, Proposal, RepairStateMachine,
    SessionReport,
};

pub use resilience::{
    BackendError, BackendRequest, BackendResponse, CallMode, Message, ReasoningBackend,
    ResilienceConfig, ResilienceStats, ResilientClient,
};

pub use runtime::{
    LanguageRuntime, ResolvedRuntime, SubprocessExecutor, TestCommand, TestExecutor,
};

pub use safety::{ApprovedPatchSet, SafetyEngine, SafetyPolicy};

pub use snapshot::{load_snapshot, SessionSnapshot, SnapshotStore};

pub use workspace::{AppliedPatch, FsWorkspace, Workspace};
