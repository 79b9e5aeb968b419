//! Content and size analysis over the lines a patch set adds.

use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use super::policy::SafetyPolicy;
use crate::domain::{PatchSet, RiskLevel, RuleKind, TriggeredRule};

struct Signature {
    rule: &'static str,
    level: RiskLevel,
    detail: &'static str,
    regex: Regex,
}

fn signature(rule: &'static str, level: RiskLevel, detail: &'static str, pattern: &str) -> Signature {
    Signature {
        rule,
        level,
        detail,
        regex: Regex::new(pattern).expect("dangerous-operation regex should compile"),
    }
}

static DANGEROUS_OPERATIONS: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        signature(
            "shell_exec",
            RiskLevel::High,
            "shell command execution",
            r"\bos\.system\s*\(|\bos\.popen\s*\(|subprocess\.\w+\([^)]*shell\s*=\s*True|\bchild_process\b|\bexecSync\s*\(|\bexec\.Command\s*\(|Runtime\.getRuntime\(\)\.exec|std::process::Command|\bsystem\s*\(",
        ),
        signature(
            "fs_deletion",
            RiskLevel::High,
            "recursive or unchecked filesystem deletion",
            r"\brm\s+-[a-zA-Z]*[rf][a-zA-Z]*\b|shutil\.rmtree|\bos\.(?:remove|unlink|rmdir|removedirs)\s*\(|\bfs\.(?:rm|rmdir|unlink)(?:Sync)?\s*\(|\bos\.RemoveAll\s*\(|remove_dir_all\s*\(",
        ),
        signature(
            "code_exec",
            RiskLevel::High,
            "dynamic code execution",
            r"\beval\s*\(|\bexec\s*\(|\bnew\s+Function\s*\(|\bpickle\.loads?\s*\(|\b__import__\s*\(",
        ),
        signature(
            "destructive_sql",
            RiskLevel::High,
            "destructive SQL statement",
            r"(?i)\bdrop\s+(?:table|database|schema)\b|\btruncate\s+table\b",
        ),
        signature(
            "privilege_change",
            RiskLevel::High,
            "privilege escalation or world-writable permissions",
            r"\bsudo\s|\bchmod\s+(?:-R\s+)?0?777\b",
        ),
        signature(
            "credential_reference",
            RiskLevel::Medium,
            "assignment to a credential-like identifier",
            r"(?i)\b(?:password|passwd|secret|token|api_key|apikey)\s*=",
        ),
    ]
});

static PRIVATE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----").expect("PRIVATE_KEY regex should compile")
});

static KEYED_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b[a-z0-9_]*(?:api[_-]?key|secret|token|passw(?:or)?d|pwd|private[_-]?key|access[_-]?key|auth|credential)[a-z0-9_]*\b["']?\s*[:=]\s*["']([^"'\s]+)["']"#,
    )
    .expect("KEYED_LITERAL regex should compile")
});

static KNOWN_TOKEN_FORMATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:AKIA[0-9A-Z]{16}|gh[pousr]_[A-Za-z0-9]{36}|sk-[A-Za-z0-9_-]{20,}|xox[baprs]-[A-Za-z0-9-]{10,})\b")
        .expect("KNOWN_TOKEN_FORMATS regex should compile")
});

/// Shannon entropy in bits per character.
pub fn shannon_entropy(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// Findings of the content/size pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentReport {
    pub level: RiskLevel,
    pub rules: Vec<TriggeredRule>,
    /// A per-file or total changed-line threshold was exceeded.
    pub threshold_overrun: bool,
}

impl ContentReport {
    fn push(&mut self, rule: TriggeredRule) {
        self.level = self.level.max(rule.level);
        self.rules.push(rule);
    }
}

/// Scan every added line of `patch_set` and measure its size.
pub fn scan_patch_set(patch_set: &PatchSet, policy: &SafetyPolicy) -> ContentReport {
    let mut report = ContentReport::default();
    let mut seen: HashSet<(&'static str, String)> = HashSet::new();

    for patch in &patch_set.patches {
        for line in patch.added_lines() {
            for sig in DANGEROUS_OPERATIONS.iter() {
                if sig.regex.is_match(line) && seen.insert((sig.rule, patch.file_path.clone())) {
                    report.push(
                        TriggeredRule::new(
                            RuleKind::DangerousOperation,
                            sig.rule,
                            sig.level,
                            format!("{}: {}", sig.detail, line.trim()),
                        )
                        .on_file(&patch.file_path),
                    );
                }
            }
            if let Some(rule) = secret_in_line(line, policy) {
                if seen.insert((rule.rule_id(), patch.file_path.clone())) {
                    report.push(rule.into_rule().on_file(&patch.file_path));
                }
            }
        }
    }

    let mut changed_by_file: BTreeMap<&str, usize> = BTreeMap::new();
    for patch in &patch_set.patches {
        *changed_by_file.entry(patch.file_path.as_str()).or_default() += patch.changed_lines();
    }
    for (path, changed) in changed_by_file {
        if changed > policy.max_lines_per_file {
            report.threshold_overrun = true;
            report.push(
                TriggeredRule::new(
                    RuleKind::SizeThreshold,
                    "file_size_threshold",
                    RiskLevel::Medium,
                    format!(
                        "{changed} changed lines exceeds per-file limit {}",
                        policy.max_lines_per_file
                    ),
                )
                .on_file(path),
            );
        }
    }

    let total = patch_set.total_changed_lines();
    if total > policy.max_total_lines {
        report.threshold_overrun = true;
        report.push(TriggeredRule::new(
            RuleKind::SizeThreshold,
            "total_size_threshold",
            RiskLevel::Medium,
            format!("{total} changed lines exceeds total limit {}", policy.max_total_lines),
        ));
    } else if total > policy.auto_approve_max_lines {
        report.push(TriggeredRule::new(
            RuleKind::SizeThreshold,
            "review_size",
            RiskLevel::Medium,
            format!(
                "{total} changed lines exceeds auto-approve limit {}",
                policy.auto_approve_max_lines
            ),
        ));
    }

    report
}

enum SecretHit {
    PrivateKey,
    Literal { entropy: f64 },
    KnownFormat,
}

impl SecretHit {
    fn rule_id(&self) -> &'static str {
        match self {
            Self::PrivateKey => "private_key",
            Self::Literal { .. } | Self::KnownFormat => "secret_literal",
        }
    }

    fn into_rule(self) -> TriggeredRule {
        match self {
            Self::PrivateKey => TriggeredRule::new(
                RuleKind::SecretLiteral,
                "private_key",
                RiskLevel::Critical,
                "private key material",
            ),
            Self::Literal { entropy } => TriggeredRule::new(
                RuleKind::SecretLiteral,
                "secret_literal",
                RiskLevel::High,
                format!("high-entropy literal ({entropy:.2} bits/char) assigned to a credential identifier"),
            ),
            Self::KnownFormat => TriggeredRule::new(
                RuleKind::SecretLiteral,
                "secret_literal",
                RiskLevel::High,
                "literal matches a known access-token format",
            ),
        }
    }
}

fn secret_in_line(line: &str, policy: &SafetyPolicy) -> Option<SecretHit> {
    if PRIVATE_KEY.is_match(line) {
        return Some(SecretHit::PrivateKey);
    }
    if KNOWN_TOKEN_FORMATS.is_match(line) {
        return Some(SecretHit::KnownFormat);
    }
    for caps in KEYED_LITERAL.captures_iter(line) {
        let Some(literal) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if literal.chars().count() < policy.min_secret_length {
            continue;
        }
        let entropy = shannon_entropy(literal);
        if entropy >= policy.entropy_threshold {
            return Some(SecretHit::Literal { entropy });
        }
    }
    None
}
