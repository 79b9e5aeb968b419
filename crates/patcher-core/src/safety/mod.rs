//! Risk assessment and approval gating for proposed patch sets.
//!
//! [`SafetyEngine::assess`] runs two passes over a patch set:
//! - path classification of every touched file
//! - content and size analysis of every added line
//!
//! The passes are combined per [`RiskCombination`] and mapped to an
//! [`ApprovalStatus`]. Patches can only reach the repository through an
//! [`ApprovedPatchSet`], which [`SafetyEngine::approve`] refuses to mint for
//! blocked or above-ceiling assessments.

pub mod content;
pub mod paths;
pub mod policy;

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

pub use content::{scan_patch_set, shannon_entropy, ContentReport};
pub use paths::{classify_path, normalize_path, BlockedPaths, PathClassification};
pub use policy::{RiskCombination, SafetyPolicy};

use crate::domain::{
    ApprovalStatus, FileRisk, PatchSet, PatcherError, Result, RiskAssessment, RiskLevel, RuleKind,
    TriggeredRule,
};

/// A patch set whose assessment cleared the approval ceiling.
#[derive(Debug, Clone)]
pub struct ApprovedPatchSet {
    patch_set: PatchSet,
    assessment_id: Uuid,
    status: ApprovalStatus,
}

impl ApprovedPatchSet {
    pub fn patch_set(&self) -> &PatchSet {
        &self.patch_set
    }

    pub fn assessment_id(&self) -> Uuid {
        self.assessment_id
    }

    pub fn status(&self) -> ApprovalStatus {
        self.status
    }

    pub fn into_inner(self) -> PatchSet {
        self.patch_set
    }
}

/// Classifies patch sets and keeps an audit trail of every verdict.
#[derive(Debug)]
pub struct SafetyEngine {
    policy: SafetyPolicy,
    blocked: BlockedPaths,
    audit: Mutex<Vec<RiskAssessment>>,
}

impl SafetyEngine {
    pub fn new(policy: SafetyPolicy) -> Result<Self> {
        let blocked = BlockedPaths::new(&policy.blocked_paths)?;
        Ok(Self {
            policy,
            blocked,
            audit: Mutex::new(Vec::new()),
        })
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Compute a fresh assessment for `patch_set`.
    pub fn assess(&self, patch_set: &PatchSet) -> RiskAssessment {
        let mut rules = Vec::new();
        let mut path_risk = RiskLevel::Minimal;
        let mut blocked = false;

        let mut changed_by_file: BTreeMap<&str, usize> = BTreeMap::new();
        for patch in &patch_set.patches {
            *changed_by_file.entry(patch.file_path.as_str()).or_default() += patch.changed_lines();
        }

        let mut files = Vec::new();
        for path in patch_set.touched_paths() {
            let class = classify_path(path);
            path_risk = path_risk.max(class.level);
            if let Some(rule) = class.rule {
                rules.push(
                    TriggeredRule::new(
                        RuleKind::PathPattern,
                        rule,
                        class.level,
                        format!("{} path", class.level),
                    )
                    .on_file(path),
                );
            }
            if let Some(glob) = self.blocked.matching(path) {
                blocked = true;
                rules.push(
                    TriggeredRule::new(
                        RuleKind::BlockedPath,
                        "blocked_path",
                        class.level,
                        format!("matches blocked glob {glob}"),
                    )
                    .on_file(path),
                );
            }
            files.push(FileRisk {
                path: path.to_string(),
                path_risk: class.level,
                changed_lines: changed_by_file.get(path).copied().unwrap_or(0),
            });
        }

        let content = scan_patch_set(patch_set, &self.policy);
        rules.extend(content.rules.iter().cloned());

        let level = self.policy.combination.combine(path_risk, content.level);
        let status = self
            .policy
            .decide(level, blocked || path_risk == RiskLevel::Critical, content.threshold_overrun);

        let total_changed_lines = patch_set.total_changed_lines();
        let rationale = rationale(level, status, path_risk, content.level, &rules, total_changed_lines);

        let assessment = RiskAssessment {
            id: Uuid::new_v4(),
            patch_set_id: patch_set.id,
            path_risk,
            content_risk: content.level,
            level,
            status,
            rules,
            files,
            total_changed_lines,
            rationale,
            assessed_at: Utc::now(),
        };

        if status == ApprovalStatus::Blocked {
            tracing::warn!(
                patch_set = %patch_set.id,
                rules = ?assessment.rule_ids(),
                "patch set blocked"
            );
        }
        self.audit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(assessment.clone());
        assessment
    }

    /// Mint an [`ApprovedPatchSet`] when `assessment` allows automatic application.
    pub fn approve(&self, assessment: &RiskAssessment, patch_set: PatchSet) -> Result<ApprovedPatchSet> {
        if assessment.patch_set_id != patch_set.id {
            return Err(PatcherError::SafetyViolation {
                status: ApprovalStatus::Blocked,
                rules: vec!["assessment_mismatch".to_string()],
            });
        }
        if assessment.status == ApprovalStatus::Blocked || assessment.status > self.policy.approval_ceiling {
            return Err(PatcherError::SafetyViolation {
                status: assessment.status,
                rules: assessment.rule_ids(),
            });
        }
        Ok(ApprovedPatchSet {
            patch_set,
            assessment_id: assessment.id,
            status: assessment.status,
        })
    }

    /// Every assessment produced so far, oldest first.
    pub fn audit_trail(&self) -> Vec<RiskAssessment> {
        self.audit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn rationale(
    level: RiskLevel,
    status: ApprovalStatus,
    path_risk: RiskLevel,
    content_risk: RiskLevel,
    rules: &[TriggeredRule],
    total_changed_lines: usize,
) -> String {
    let mut text = format!(
        "{status}: risk {level} (path {path_risk}, content {content_risk}), {total_changed_lines} changed lines"
    );
    if !rules.is_empty() {
        let fired: Vec<String> = rules
            .iter()
            .map(|r| match &r.file {
                Some(file) => format!("{} [{file}]", r.rule),
                None => r.rule.clone(),
            })
            .collect();
        text.push_str("; rules: ");
        text.push_str(&fired.join(", "));
    }
    text
}
