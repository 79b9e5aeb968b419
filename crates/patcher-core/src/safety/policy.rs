//! Thresholds and strategy knobs for the safety engine.

use serde::{Deserialize, Serialize};

use crate::domain::{ApprovalStatus, RiskLevel};

/// How path risk and content risk are folded into the final level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RiskCombination {
    /// Final risk is the higher of the two passes.
    #[default]
    Max,
    /// Weighted mean of the two ordinals, rounded up. A critical pass never
    /// drops below `high`.
    Weighted {
        path_weight: f64,
        content_weight: f64,
    },
}

impl RiskCombination {
    pub fn combine(&self, path: RiskLevel, content: RiskLevel) -> RiskLevel {
        match *self {
            Self::Max => path.max(content),
            Self::Weighted {
                path_weight,
                content_weight,
            } => {
                let total = path_weight + content_weight;
                if !(total.is_finite() && total > 0.0) || path_weight < 0.0 || content_weight < 0.0
                {
                    return path.max(content);
                }
                let mean = (f64::from(path.ordinal()) * path_weight
                    + f64::from(content.ordinal()) * content_weight)
                    / total;
                let level = RiskLevel::from_ordinal(mean.ceil() as u8);
                if path == RiskLevel::Critical || content == RiskLevel::Critical {
                    level.max(RiskLevel::High)
                } else {
                    level
                }
            }
        }
    }
}

/// Safety thresholds applied to every patch set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Changed lines allowed in one file before approval is required.
    pub max_lines_per_file: usize,
    /// Changed lines allowed across the patch set before approval is required.
    pub max_total_lines: usize,
    /// Largest patch set that may be auto-approved.
    pub auto_approve_max_lines: usize,
    /// Globs that block a patch outright (`**`, `*`, `?`; case-insensitive).
    pub blocked_paths: Vec<String>,
    /// Shannon entropy (bits per char) above which a keyed literal is secret-like.
    pub entropy_threshold: f64,
    pub min_secret_length: usize,
    pub combination: RiskCombination,
    /// Most permissive status the repair loop applies without a human.
    pub approval_ceiling: ApprovalStatus,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_lines_per_file: 100,
            max_total_lines: 500,
            auto_approve_max_lines: 20,
            blocked_paths: Vec::new(),
            entropy_threshold: 3.5,
            min_secret_length: 16,
            combination: RiskCombination::Max,
            approval_ceiling: ApprovalStatus::NeedsReview,
        }
    }
}

impl SafetyPolicy {
    pub fn with_blocked_path(mut self, glob: impl Into<String>) -> Self {
        self.blocked_paths.push(glob.into());
        self
    }

    pub fn with_combination(mut self, combination: RiskCombination) -> Self {
        self.combination = combination;
        self
    }

    /// Map a combined risk level plus overrun flags to an approval status.
    pub fn decide(&self, level: RiskLevel, blocked: bool, threshold_overrun: bool) -> ApprovalStatus {
        if blocked || level == RiskLevel::Critical {
            ApprovalStatus::Blocked
        } else if level == RiskLevel::High || threshold_overrun {
            ApprovalStatus::RequiresApproval
        } else if level == RiskLevel::Medium {
            ApprovalStatus::NeedsReview
        } else {
            ApprovalStatus::AutoApproved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_combination() {
        let c = RiskCombination::Max;
        assert_eq!(c.combine(RiskLevel::Low, RiskLevel::High), RiskLevel::High);
        assert_eq!(c.combine(RiskLevel::Critical, RiskLevel::Minimal), RiskLevel::Critical);
    }

    #[test]
    fn test_weighted_combination_rounds_up() {
        let c = RiskCombination::Weighted {
            path_weight: 0.5,
            content_weight: 0.5,
        };
        // (1 + 2) / 2 = 1.5 -> 2
        assert_eq!(c.combine(RiskLevel::Low, RiskLevel::Medium), RiskLevel::Medium);
        assert_eq!(c.combine(RiskLevel::Minimal, RiskLevel::Minimal), RiskLevel::Minimal);
    }

    #[test]
    fn test_weighted_never_dilutes_critical_below_high() {
        let c = RiskCombination::Weighted {
            path_weight: 0.1,
            content_weight: 0.9,
        };
        assert_eq!(c.combine(RiskLevel::Critical, RiskLevel::Minimal), RiskLevel::High);
    }

    #[test]
    fn test_degenerate_weights_fall_back_to_max() {
        let c = RiskCombination::Weighted {
            path_weight: 0.0,
            content_weight: 0.0,
        };
        assert_eq!(c.combine(RiskLevel::Low, RiskLevel::Medium), RiskLevel::Medium);
    }

    #[test]
    fn test_decide_mapping() {
        let p = SafetyPolicy::default();
        assert_eq!(p.decide(RiskLevel::Critical, false, false), ApprovalStatus::Blocked);
        assert_eq!(p.decide(RiskLevel::Minimal, true, false), ApprovalStatus::Blocked);
        assert_eq!(p.decide(RiskLevel::High, false, false), ApprovalStatus::RequiresApproval);
        assert_eq!(p.decide(RiskLevel::Low, false, true), ApprovalStatus::RequiresApproval);
        assert_eq!(p.decide(RiskLevel::Medium, false, false), ApprovalStatus::NeedsReview);
        assert_eq!(p.decide(RiskLevel::Low, false, false), ApprovalStatus::AutoApproved);
    }

    #[test]
    fn test_policy_from_partial_toml() {
        let policy: SafetyPolicy = toml::from_str(
            r#"
            max_total_lines = 50
            blocked_paths = ["migrations/**"]

            [combination]
            strategy = "weighted"
            path_weight = 0.7
            content_weight = 0.3
            "#,
        )
        .expect("parse");
        assert_eq!(policy.max_total_lines, 50);
        assert_eq!(policy.max_lines_per_file, 100);
        assert_eq!(policy.blocked_paths, vec!["migrations/**".to_string()]);
        assert!(matches!(policy.combination, RiskCombination::Weighted { .. }));
    }
}
