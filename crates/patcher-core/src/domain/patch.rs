//! Code patches: per-file ordered modifications and the patch set that
//! groups them for one PATCH attempt.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a single modification does to its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    /// Insert `content` before the anchored line (or append when the anchor
    /// is one past the end or absent).
    Insert,
    /// Replace the anchored line with `content`.
    Replace,
    /// Remove the anchored line.
    Delete,
    /// Create the file with `content`. The file must not exist yet.
    Create,
}

/// One edit inside a [`CodePatch`]. Line anchors are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default)]
    pub content: String,
    /// Current text of the anchored line, checked before replacing or deleting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl Modification {
    pub fn insert(line: usize, content: impl Into<String>) -> Self {
        Self {
            kind: ModificationKind::Insert,
            line: Some(line),
            content: content.into(),
            expected: None,
        }
    }

    pub fn replace(line: usize, content: impl Into<String>) -> Self {
        Self {
            kind: ModificationKind::Replace,
            line: Some(line),
            content: content.into(),
            expected: None,
        }
    }

    pub fn delete(line: usize) -> Self {
        Self {
            kind: ModificationKind::Delete,
            line: Some(line),
            content: String::new(),
            expected: None,
        }
    }

    pub fn create(content: impl Into<String>) -> Self {
        Self {
            kind: ModificationKind::Create,
            line: None,
            content: content.into(),
            expected: None,
        }
    }

    pub fn expecting(mut self, current: impl Into<String>) -> Self {
        self.expected = Some(current.into());
        self
    }

    /// Lines this modification adds.
    pub fn lines_added(&self) -> usize {
        match self.kind {
            ModificationKind::Delete => 0,
            _ => content_line_count(&self.content),
        }
    }

    /// Lines this modification removes.
    pub fn lines_removed(&self) -> usize {
        match self.kind {
            ModificationKind::Replace | ModificationKind::Delete => 1,
            ModificationKind::Insert | ModificationKind::Create => 0,
        }
    }
}

fn content_line_count(content: &str) -> usize {
    if content.is_empty() {
        0
    } else {
        content.lines().count().max(1)
    }
}

/// Ordered modifications against a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePatch {
    /// Repository-relative path using `/` separators.
    pub file_path: String,
    pub modifications: Vec<Modification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl CodePatch {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            modifications: Vec::new(),
            rationale: None,
        }
    }

    pub fn with_modification(mut self, modification: Modification) -> Self {
        self.modifications.push(modification);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Diff-size metric: lines added plus lines removed.
    pub fn changed_lines(&self) -> usize {
        self.modifications
            .iter()
            .map(|m| m.lines_added() + m.lines_removed())
            .sum()
    }

    /// Every line this patch introduces, in modification order.
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.modifications
            .iter()
            .filter(|m| m.kind != ModificationKind::Delete)
            .flat_map(|m| m.content.lines())
    }

    pub fn creates_file(&self) -> bool {
        self.modifications
            .iter()
            .any(|m| m.kind == ModificationKind::Create)
    }
}

/// All patches produced for one PATCH attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub id: Uuid,
    /// Plan this patch set implements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    pub iteration: u32,
    pub patches: Vec<CodePatch>,
}

impl PatchSet {
    pub fn new(plan_id: Option<Uuid>, iteration: u32, patches: Vec<CodePatch>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            iteration,
            patches,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.iter().all(|p| p.modifications.is_empty())
    }

    pub fn total_changed_lines(&self) -> usize {
        self.patches.iter().map(CodePatch::changed_lines).sum()
    }

    /// Distinct touched paths in first-seen order.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for patch in &self.patches {
            if !seen.contains(&patch.file_path.as_str()) {
                seen.push(patch.file_path.as_str());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_lines_counts_adds_and_removes() {
        let patch = CodePatch::new("src/calc.py")
            .with_modification(Modification::insert(1, "from math import sqrt"))
            .with_modification(Modification::replace(10, "    return a + b\n    # done"))
            .with_modification(Modification::delete(20));
        // insert: +1, replace: +2 -1, delete: -1
        assert_eq!(patch.changed_lines(), 5);
    }

    #[test]
    fn test_added_lines_skip_deletes() {
        let patch = CodePatch::new("a.py")
            .with_modification(Modification::insert(1, "import os"))
            .with_modification(Modification::delete(3).expecting("x = 1"));
        let added: Vec<&str> = patch.added_lines().collect();
        assert_eq!(added, vec!["import os"]);
    }

    #[test]
    fn test_patch_set_touched_paths_are_distinct() {
        let set = PatchSet::new(
            None,
            0,
            vec![
                CodePatch::new("a.py").with_modification(Modification::insert(1, "x")),
                CodePatch::new("b.py").with_modification(Modification::insert(1, "y")),
                CodePatch::new("a.py").with_modification(Modification::insert(2, "z")),
            ],
        );
        assert_eq!(set.touched_paths(), vec!["a.py", "b.py"]);
        assert_eq!(set.total_changed_lines(), 3);
        assert!(!set.is_empty());
    }

    #[test]
    fn test_modification_deserializes_with_defaults() {
        let json = r#"{"kind":"insert","line":1,"content":"import fmt"}"#;
        let m: Modification = serde_json::from_str(json).expect("deserialize");
        assert_eq!(m.kind, ModificationKind::Insert);
        assert_eq!(m.expected, None);

        let json = r#"{"kind":"create","content":"package main\n"}"#;
        let m: Modification = serde_json::from_str(json).expect("deserialize");
        assert_eq!(m.line, None);
        assert_eq!(m.lines_added(), 1);
    }
}
