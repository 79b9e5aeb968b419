//! Risk levels, approval statuses and the assessment record produced for
//! every proposed patch set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordinal risk of applying a change automatically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        Self::Minimal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Critical,
    ];

    /// Position on the minimal..critical scale (0..=4).
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(value: u8) -> Self {
        match value {
            0 => Self::Minimal,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Approval decision, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    AutoApproved,
    NeedsReview,
    RequiresApproval,
    Blocked,
}

impl ApprovalStatus {
    /// Whether a human has to look at the change before it ships.
    pub fn requires_human(self) -> bool {
        !matches!(self, Self::AutoApproved)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoApproved => write!(f, "auto_approved"),
            Self::NeedsReview => write!(f, "needs_review"),
            Self::RequiresApproval => write!(f, "requires_approval"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Category of rule that fired during an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// A path matched one of the risk tiers.
    PathPattern,
    /// A path matched a configured blocked glob.
    BlockedPath,
    /// Added content contains a dangerous operation.
    DangerousOperation,
    /// Added content looks like a credential.
    SecretLiteral,
    /// A changed-line threshold was exceeded.
    SizeThreshold,
}

/// One rule that contributed to an assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub kind: RuleKind,
    /// Stable rule identifier, e.g. `ci_workflow` or `shell_exec`.
    pub rule: String,
    pub level: RiskLevel,
    /// File the rule fired on, when file-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub detail: String,
}

impl TriggeredRule {
    pub fn new(kind: RuleKind, rule: &str, level: RiskLevel, detail: impl Into<String>) -> Self {
        Self {
            kind,
            rule: rule.to_string(),
            level,
            file: None,
            detail: detail.into(),
        }
    }

    pub fn on_file(mut self, file: &str) -> Self {
        self.file = Some(file.to_string());
        self
    }
}

/// Per-file summary inside an assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRisk {
    pub path: String,
    pub path_risk: RiskLevel,
    pub changed_lines: usize,
}

/// Immutable risk verdict for one patch set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    /// Patch set this verdict was computed for.
    pub patch_set_id: Uuid,
    pub path_risk: RiskLevel,
    pub content_risk: RiskLevel,
    /// Combined risk after applying the configured strategy.
    pub level: RiskLevel,
    pub status: ApprovalStatus,
    pub rules: Vec<TriggeredRule>,
    pub files: Vec<FileRisk>,
    pub total_changed_lines: usize,
    pub rationale: String,
    pub assessed_at: DateTime<Utc>,
}

impl RiskAssessment {
    /// Identifiers of every rule that fired, in evaluation order.
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.rules.iter().any(|r| r.rule == rule)
    }
}
