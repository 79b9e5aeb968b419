//! The change set assembled in the PR phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::context::{PatchOutcome, SessionContext};
use crate::domain::{PatchSet, RiskLevel, Session};

/// Everything a reviewer needs to open a pull request for a green session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub session_id: Uuid,
    /// Repository-relative paths touched by committed patches, sorted.
    pub files: Vec<String>,
    /// Committed patch sets in application order.
    pub patch_sets: Vec<PatchSet>,
    pub plan_summaries: Vec<String>,
    /// Highest risk level among the committed patch sets.
    pub max_risk: RiskLevel,
    pub total_changed_lines: usize,
    pub iterations: u32,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

impl ChangeSet {
    pub fn assemble(session: &Session, context: &SessionContext) -> Self {
        let committed: Vec<_> = context
            .patches()
            .iter()
            .filter(|r| matches!(r.outcome, PatchOutcome::Committed | PatchOutcome::Kept))
            .collect();

        let files: BTreeSet<String> = committed
            .iter()
            .flat_map(|r| r.patch_set.touched_paths())
            .map(str::to_string)
            .collect();
        let plan_ids: Vec<Uuid> = committed.iter().filter_map(|r| r.patch_set.plan_id).collect();
        let plan_summaries = context
            .plans()
            .iter()
            .filter(|p| plan_ids.contains(&p.id))
            .map(|p| p.summary.clone())
            .collect();

        Self {
            session_id: session.id(),
            files: files.into_iter().collect(),
            total_changed_lines: committed.iter().map(|r| r.patch_set.total_changed_lines()).sum(),
            max_risk: committed
                .iter()
                .map(|r| r.assessment.level)
                .max()
                .unwrap_or_default(),
            patch_sets: committed.into_iter().map(|r| r.patch_set.clone()).collect(),
            plan_summaries,
            iterations: session.iteration_count(),
            cost_usd: session.accumulated_cost_usd(),
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patch_sets.is_empty()
    }
}
