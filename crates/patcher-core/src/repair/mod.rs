//! The repair loop and its collaborators.
//!
//! - [`RepairStateMachine`]: drives a session to DONE, ESCALATED or FAILED
//! - [`Planner`]: produces fix plans and patches; [`BackendPlanner`] asks the
//!   reasoning backend, [`ImportFixPlanner`] works offline
//! - [`ChangeSet`]: what a green session hands over for review

pub mod change_set;
pub mod heuristic;
pub mod machine;
pub mod planner;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub use change_set::ChangeSet;
pub use heuristic::ImportFixPlanner;
pub use machine::RepairStateMachine;
pub use planner::{describe_context, patch_schema, plan_schema, BackendPlanner, Planner, Proposal};

use crate::domain::{SessionState, TerminalOutcome, TerminalStatus};
use crate::resilience::ResilienceStats;

/// Terminal summary of a session, printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub repo: PathBuf,
    pub status: TerminalStatus,
    pub outcome: TerminalOutcome,
    pub iterations: u32,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub cost_by_phase: BTreeMap<SessionState, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resilience: Option<ResilienceStats>,
}

impl SessionReport {
    pub fn with_resilience(mut self, stats: ResilienceStats) -> Self {
        self.resilience = Some(stats);
        self
    }
}
