//! Offline planner that fixes missing imports without a backend.

use async_trait::async_trait;

use super::planner::{Planner, Proposal};
use crate::context::SessionContext;
use crate::domain::{
    ChangeType, CodePatch, FixPlan, Modification, PatcherError, PlanDraft, PlanStep, Result,
    RiskLevel,
};
use crate::runtime::SuggestionKind;

/// One import to add to one file.
#[derive(Debug, Clone, PartialEq)]
struct ImportFix {
    file: String,
    statement: String,
    confidence: f64,
    test_name: String,
}

/// Turns high-confidence import suggestions into single-line inserts.
///
/// Only files whose contents are in the context excerpts are patched, and a
/// statement already present in the file is never proposed again.
#[derive(Debug, Clone)]
pub struct ImportFixPlanner {
    min_confidence: f64,
}

impl Default for ImportFixPlanner {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl ImportFixPlanner {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    fn fixes(&self, context: &SessionContext) -> Vec<ImportFix> {
        let (Some(runtime), Some(result)) = (&context.code.runtime, context.last_result()) else {
            return Vec::new();
        };
        let hints = context.code.import_context();
        let mut fixes: Vec<ImportFix> = Vec::new();
        for failure in &result.failures {
            let Some(file) = failure.file.as_deref().map(|f| f.trim_start_matches("./")) else {
                continue;
            };
            let Some(source) = context.code.excerpts.get(file) else {
                continue;
            };
            let best = runtime
                .suggest_imports(&failure.error_text(), &hints)
                .into_iter()
                .filter(|s| s.kind == SuggestionKind::Import && s.confidence >= self.min_confidence)
                .find(|s| !source.lines().any(|l| l.trim() == s.statement.trim()));
            let Some(suggestion) = best else {
                continue;
            };
            let duplicate = fixes
                .iter()
                .any(|f| f.file == file && f.statement == suggestion.statement);
            if !duplicate {
                fixes.push(ImportFix {
                    file: file.to_string(),
                    statement: suggestion.statement,
                    confidence: suggestion.confidence,
                    test_name: failure.test_name.clone(),
                });
            }
        }
        fixes
    }
}

#[async_trait]
impl Planner for ImportFixPlanner {
    fn name(&self) -> &str {
        "import-fix"
    }

    async fn plan(&self, context: &SessionContext, _iteration: u32) -> Result<Proposal<PlanDraft>> {
        let fixes = self.fixes(context);
        let steps = fixes
            .iter()
            .map(|f| PlanStep {
                description: format!("add `{}`", f.statement),
                file_path: f.file.clone(),
                change_type: ChangeType::Modify,
                rationale: Some(format!("unresolved name in {}", f.test_name)),
            })
            .collect();
        let confidence = fixes
            .iter()
            .map(|f| f.confidence)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.min(c))))
            .unwrap_or(0.0);
        let mut addresses: Vec<String> = fixes.iter().map(|f| f.test_name.clone()).collect();
        addresses.dedup();
        Ok(Proposal::free(PlanDraft {
            summary: format!("add {} missing import(s)", fixes.len()),
            steps,
            risk_level: RiskLevel::Low,
            confidence,
            addresses,
        }))
    }

    async fn patch(&self, plan: &FixPlan, context: &SessionContext) -> Result<Proposal<Vec<CodePatch>>> {
        let runtime = context
            .code
            .runtime
            .as_ref()
            .ok_or_else(|| PatcherError::unrecoverable("language runtime was not resolved"))?;
        let targets = plan.target_files();
        let mut patches: Vec<CodePatch> = Vec::new();
        for fix in self.fixes(context) {
            if !targets.contains(&fix.file.as_str()) {
                continue;
            }
            let Some(source) = context.code.excerpts.get(&fix.file) else {
                continue;
            };
            let line = runtime.runtime.import_insertion_line(source);
            let modification = Modification::insert(line, fix.statement.clone());
            match patches.iter_mut().find(|p| p.file_path == fix.file) {
                Some(patch) => patch.modifications.push(modification),
                None => patches.push(
                    CodePatch::new(fix.file.clone())
                        .with_modification(modification)
                        .with_rationale(format!("missing import for {}", fix.test_name)),
                ),
            }
        }
        Ok(Proposal::free(patches))
    }
}
