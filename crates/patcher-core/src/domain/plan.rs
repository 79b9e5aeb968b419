//! Fix plans produced by the PLAN phase.
//!
//! Plans are immutable once produced. A repair iteration supersedes the
//! previous plan by producing a new one that points back at it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::risk::RiskLevel;

/// Kind of change a plan step intends to make.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Modify,
    Add,
    Delete,
}

/// One ordered step of a fix plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub file_path: String,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Structured plan body as produced by a planner, before it is stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub summary: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    pub confidence: f64,
    /// Failing tests this plan addresses.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Immutable, stamped fix plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPlan {
    pub id: Uuid,
    pub iteration: u32,
    pub summary: String,
    pub steps: Vec<PlanStep>,
    pub risk_level: RiskLevel,
    /// Planner confidence, clamped to 0..=1.
    pub confidence: f64,
    pub addresses: Vec<String>,
    /// Plan this one replaces, if produced during repair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl FixPlan {
    pub fn from_draft(draft: PlanDraft, iteration: u32, supersedes: Option<Uuid>) -> Self {
        let confidence = if draft.confidence.is_finite() {
            draft.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            id: Uuid::new_v4(),
            iteration,
            summary: draft.summary,
            steps: draft.steps,
            risk_level: draft.risk_level,
            confidence,
            addresses: draft.addresses,
            supersedes,
            created_at: Utc::now(),
        }
    }

    /// Files the plan intends to touch, in step order.
    pub fn target_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !files.contains(&step.file_path.as_str()) {
                files.push(step.file_path.as_str());
            }
        }
        files
    }
}
