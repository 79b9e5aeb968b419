//! Session-scoped working memory.
//!
//! [`SessionContext`] accumulates what one repair session has learned:
//! - code context (runtime, manifest, file tree, excerpts)
//! - a bounded conversation log
//! - plan, patch and failure-analysis history
//! - spend broken down by phase

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::domain::{
    FixPlan, PatchSet, Result, RiskAssessment, SessionState, TestExecutionResult,
};
use crate::resilience::Message;
use crate::runtime::detect::is_ignored;
use crate::runtime::{DependencyManifest, ImportContext, ImportSuggestion, ResolvedRuntime};

pub const DEFAULT_MAX_MESSAGES: usize = 40;
pub const DEFAULT_MAX_FILES: usize = 500;
/// Largest excerpt kept per file, in bytes.
pub const MAX_EXCERPT_BYTES: usize = 16 * 1024;

/// What the session knows about the repository's code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ResolvedRuntime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<DependencyManifest>,
    /// Repository-relative source paths, sorted, capped.
    #[serde(default)]
    pub file_tree: Vec<String>,
    /// Contents of files referenced by failures.
    #[serde(default)]
    pub excerpts: BTreeMap<String, String>,
}

impl CodeContext {
    /// Hints for import suggestion derived from the file tree and manifest.
    pub fn import_context(&self) -> ImportContext {
        let extensions: &[&str] = self
            .runtime
            .as_ref()
            .map(|r| r.runtime.source_extensions())
            .unwrap_or(&[]);
        let mut modules = BTreeSet::new();
        for path in &self.file_tree {
            let path = Path::new(path);
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.contains(&e))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !matches!(stem, "__init__" | "index" | "mod" | "lib" | "main") {
                    modules.insert(stem.to_string());
                }
            }
        }
        ImportContext {
            local_modules: modules.into_iter().collect(),
            dependencies: self
                .manifest
                .as_ref()
                .map(DependencyManifest::dependency_names)
                .unwrap_or_default(),
            esm: self.runtime.as_ref().map(|r| r.esm).unwrap_or(false),
            ..ImportContext::default()
        }
    }
}

/// List repository files, skipping build output and vendored trees.
pub fn collect_file_tree(repo: &Path, limit: usize) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(repo)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e));
    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(repo) {
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
        if files.len() >= limit {
            break;
        }
    }
    Ok(files)
}

/// Lifecycle of a patch set after it was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Assessed but not applied (gated or superseded).
    NotApplied,
    /// Applied; awaiting a TEST verdict.
    Pending,
    /// Fixed something without regressions; kept across iterations.
    Kept,
    /// Made permanent when the session reached DONE.
    Committed,
    RolledBack,
}

/// One proposed patch set with its verdict and fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub patch_set: PatchSet,
    pub assessment: RiskAssessment,
    pub outcome: PatchOutcome,
}

/// Failure-set comparison between two consecutive TEST runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub iteration: u32,
    pub failing: BTreeSet<String>,
    /// Previously failing, now passing.
    pub fixed: Vec<String>,
    /// Newly failing.
    pub introduced: Vec<String>,
    pub persisting: Vec<String>,
    /// The run hit a build or setup failure the reference run did not have.
    #[serde(default)]
    pub build_broken: bool,
}

impl FailureAnalysis {
    pub fn compare(iteration: u32, previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            iteration,
            failing: current.clone(),
            fixed: previous.difference(current).cloned().collect(),
            introduced: current.difference(previous).cloned().collect(),
            persisting: previous.intersection(current).cloned().collect(),
            build_broken: false,
        }
    }

    pub fn with_build_broken(mut self, broken: bool) -> Self {
        self.build_broken = broken;
        self
    }

    /// False when the failing set is the same as before or a superset of it,
    /// or when the build broke and hid the real results.
    pub fn made_progress(&self) -> bool {
        !self.build_broken && !self.fixed.is_empty()
    }

    /// Whether the latest patch should be kept: something fixed, nothing broken.
    pub fn keeps_patch(&self) -> bool {
        self.made_progress() && self.introduced.is_empty()
    }
}

/// Mutable store for one repair session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub code: CodeContext,
    conversation: VecDeque<Message>,
    max_messages: usize,
    plans: Vec<FixPlan>,
    patches: Vec<PatchRecord>,
    analyses: Vec<FailureAnalysis>,
    suggestions: Vec<ImportSuggestion>,
    cost_by_phase: BTreeMap<SessionState, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    baseline: Option<TestExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_result: Option<TestExecutionResult>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl SessionContext {
    pub fn new(max_messages: usize) -> Self {
        Self {
            code: CodeContext::default(),
            conversation: VecDeque::new(),
            max_messages: max_messages.max(1),
            plans: Vec::new(),
            patches: Vec::new(),
            analyses: Vec::new(),
            suggestions: Vec::new(),
            cost_by_phase: BTreeMap::new(),
            baseline: None,
            last_result: None,
        }
    }

    /// Append a turn, dropping the oldest once the log is full.
    pub fn push_message(&mut self, message: Message) {
        if self.conversation.len() == self.max_messages {
            self.conversation.pop_front();
        }
        self.conversation.push_back(message);
    }

    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.conversation.iter()
    }

    pub fn record_plan(&mut self, plan: FixPlan) {
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[FixPlan] {
        &self.plans
    }

    pub fn latest_plan(&self) -> Option<&FixPlan> {
        self.plans.last()
    }

    pub fn record_patch(&mut self, patch_set: PatchSet, assessment: RiskAssessment, outcome: PatchOutcome) {
        self.patches.push(PatchRecord {
            patch_set,
            assessment,
            outcome,
        });
    }

    pub fn set_patch_outcome(&mut self, patch_set_id: Uuid, outcome: PatchOutcome) {
        if let Some(record) = self
            .patches
            .iter_mut()
            .rev()
            .find(|r| r.patch_set.id == patch_set_id)
        {
            record.outcome = outcome;
        }
    }

    pub fn patches(&self) -> &[PatchRecord] {
        &self.patches
    }

    /// Patch sets still on disk and not yet committed, oldest first.
    pub fn applied_patch_ids(&self) -> Vec<Uuid> {
        self.patches
            .iter()
            .filter(|r| matches!(r.outcome, PatchOutcome::Pending | PatchOutcome::Kept))
            .map(|r| r.patch_set.id)
            .collect()
    }

    pub fn record_analysis(&mut self, analysis: FailureAnalysis) {
        self.analyses.push(analysis);
    }

    pub fn analyses(&self) -> &[FailureAnalysis] {
        &self.analyses
    }

    /// Failing tests of the last state whose patches were kept, or of the
    /// baseline when nothing was kept yet.
    pub fn reference_failures(&self) -> BTreeSet<String> {
        self.analyses
            .iter()
            .rev()
            .find(|a| a.keeps_patch())
            .map(|a| a.failing.clone())
            .or_else(|| self.baseline.as_ref().map(TestExecutionResult::failing_set))
            .unwrap_or_default()
    }

    /// Length of the trailing run of analyses without progress.
    pub fn consecutive_no_progress(&self) -> u32 {
        self.analyses
            .iter()
            .rev()
            .take_while(|a| !a.made_progress())
            .count() as u32
    }

    pub fn set_suggestions(&mut self, suggestions: Vec<ImportSuggestion>) {
        self.suggestions = suggestions;
    }

    pub fn suggestions(&self) -> &[ImportSuggestion] {
        &self.suggestions
    }

    pub fn add_cost(&mut self, phase: SessionState, usd: f64) {
        if usd.is_finite() && usd > 0.0 {
            *self.cost_by_phase.entry(phase).or_default() += usd;
        }
    }

    pub fn cost_by_phase(&self) -> &BTreeMap<SessionState, f64> {
        &self.cost_by_phase
    }

    pub fn set_baseline(&mut self, result: TestExecutionResult) {
        self.last_result = Some(result.clone());
        self.baseline = Some(result);
    }

    pub fn baseline(&self) -> Option<&TestExecutionResult> {
        self.baseline.as_ref()
    }

    pub fn set_last_result(&mut self, result: TestExecutionResult) {
        self.last_result = Some(result);
    }

    pub fn last_result(&self) -> Option<&TestExecutionResult> {
        self.last_result.as_ref()
    }

    /// Load excerpts for files that appear in the latest failures.
    ///
    /// Failure locations come from test output, so each one is canonicalized
    /// and must resolve to a regular file inside `repo`.
    pub fn refresh_excerpts(&mut self, repo: &Path) {
        let Some(result) = self.last_result.as_ref() else {
            return;
        };
        let Ok(root) = repo.canonicalize() else {
            return;
        };
        for file in result.failing_files() {
            let Ok(path) = root.join(file.trim_start_matches("./")).canonicalize() else {
                continue;
            };
            let Ok(rel) = path.strip_prefix(&root) else {
                tracing::warn!(file = %file, "ignoring failure location outside the repository");
                continue;
            };
            if !path.is_file() {
                continue;
            }
            let rel = rel.to_string_lossy().replace('\\', "/");
            match std::fs::read_to_string(&path) {
                Ok(mut text) => {
                    if text.len() > MAX_EXCERPT_BYTES {
                        let mut cut = MAX_EXCERPT_BYTES;
                        while !text.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        text.truncate(cut);
                    }
                    self.code.excerpts.insert(rel, text);
                }
                Err(e) => tracing::debug!(file = %rel, error = %e, "skipping unreadable excerpt"),
            }
        }
    }
}
