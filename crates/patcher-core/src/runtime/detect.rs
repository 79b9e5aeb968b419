//! Repository language detection by manifest and source-file scoring.

use std::collections::HashMap;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use super::LanguageRuntime;
use crate::domain::{PatcherError, Result};

/// Points awarded for each manifest present at the repository root.
const MANIFEST_WEIGHT: u32 = 10;
const MAX_DEPTH: usize = 8;
const MAX_FILES: usize = 20_000;

/// Directories never scanned for sources.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    "dist",
    "build",
    ".next",
    ".mypy_cache",
    ".pytest_cache",
    ".repo-patcher",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageScore {
    pub runtime: LanguageRuntime,
    pub score: u32,
}

pub(crate) fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Score every runtime: manifests at the root plus the number of source files.
/// Highest score first; ties keep declaration order.
pub fn score_languages(repo: &Path) -> Result<Vec<LanguageScore>> {
    if !repo.is_dir() {
        return Err(PatcherError::unrecoverable(format!(
            "repository path is not a directory: {}",
            repo.display()
        )));
    }

    let mut by_extension: HashMap<String, u32> = HashMap::new();
    let walker = WalkDir::new(repo)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| !is_ignored(e));
    for entry in walker.filter_map(|e| e.ok()).take(MAX_FILES) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) {
            *by_extension.entry(ext.to_ascii_lowercase()).or_default() += 1;
        }
    }

    let mut scores: Vec<LanguageScore> = LanguageRuntime::ALL
        .iter()
        .map(|&runtime| {
            let manifests = runtime
                .manifest_files()
                .iter()
                .filter(|m| repo.join(m).is_file())
                .count() as u32;
            let sources: u32 = runtime
                .source_extensions()
                .iter()
                .map(|ext| by_extension.get(*ext).copied().unwrap_or(0))
                .sum();
            LanguageScore {
                runtime,
                score: manifests * MANIFEST_WEIGHT + sources,
            }
        })
        .collect();
    scores.sort_by(|a, b| b.score.cmp(&a.score));
    tracing::debug!(?scores, "language scores");
    Ok(scores)
}

/// Best-scoring runtime, or `None` when nothing recognisable is present.
pub fn detect_language(repo: &Path) -> Result<Option<LanguageRuntime>> {
    Ok(score_languages(repo)?
        .into_iter()
        .find(|s| s.score > 0)
        .map(|s| s.runtime))
}
