//! Per-ecosystem test execution and output normalization.
//!
//! [`LanguageRuntime`] is a closed set of ecosystems. Each variant delegates
//! to its own module for framework detection, command construction, output
//! parsing, import suggestion and manifest reading. A [`ResolvedRuntime`] is
//! computed once at INGEST and reused for the rest of the session.

pub mod detect;
pub mod executor;
pub mod go;
pub mod javascript;
pub mod python;
pub mod rust;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

pub use detect::{detect_language, score_languages, LanguageScore};
pub use executor::{CommandOutput, SubprocessExecutor, TestCommand, TestExecutor};

use crate::domain::{
    FailureKind, PatcherError, Result, TestExecutionResult, TestFailure, TestFramework,
};

/// Supported ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageRuntime {
    Python,
    JavaScript,
    Go,
    Rust,
}

impl std::fmt::Display for LanguageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::JavaScript => write!(f, "javascript"),
            Self::Go => write!(f, "go"),
            Self::Rust => write!(f, "rust"),
        }
    }
}

impl LanguageRuntime {
    pub const ALL: [LanguageRuntime; 4] = [Self::Python, Self::JavaScript, Self::Go, Self::Rust];

    /// Manifest files whose presence signals this ecosystem.
    pub fn manifest_files(self) -> &'static [&'static str] {
        match self {
            Self::Python => python::MANIFESTS,
            Self::JavaScript => javascript::MANIFESTS,
            Self::Go => go::MANIFESTS,
            Self::Rust => rust::MANIFESTS,
        }
    }

    pub fn source_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["py"],
            Self::JavaScript => &["js", "jsx", "ts", "tsx", "mjs", "cjs"],
            Self::Go => &["go"],
            Self::Rust => &["rs"],
        }
    }

    pub fn detect_framework(self, repo: &Path) -> TestFramework {
        match self {
            Self::Python => python::detect_framework(repo),
            Self::JavaScript => javascript::detect_framework(repo),
            Self::Go => go::detect_framework(repo),
            Self::Rust => rust::detect_framework(repo),
        }
    }

    pub fn build_test_command(self, framework: TestFramework) -> TestCommand {
        match self {
            Self::Python => python::test_command(framework),
            Self::JavaScript => javascript::test_command(framework),
            Self::Go => go::test_command(framework),
            Self::Rust => rust::test_command(framework),
        }
    }

    pub fn parse_output(
        self,
        framework: TestFramework,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
    ) -> TestExecutionResult {
        let stdout = strip_ansi(stdout);
        let stderr = strip_ansi(stderr);
        let result = match self {
            Self::Python => python::parse_output(&stdout, &stderr, exit_code),
            Self::JavaScript => javascript::parse_output(framework, &stdout, &stderr, exit_code),
            Self::Go => go::parse_output(&stdout, &stderr, exit_code),
            Self::Rust => rust::parse_output(&stdout, &stderr, exit_code),
        };
        finalize(result, exit_code)
    }

    /// Ranked, de-duplicated missing-import fixes for `error_message`.
    pub fn suggest_imports(self, error_message: &str, context: &ImportContext) -> Vec<ImportSuggestion> {
        let raw = match self {
            Self::Python => python::suggest_imports(error_message, context),
            Self::JavaScript => javascript::suggest_imports(error_message, context),
            Self::Go => go::suggest_imports(error_message, context),
            Self::Rust => rust::suggest_imports(error_message, context),
        };
        rank_suggestions(raw, context.max_suggestions)
    }

    pub fn read_dependency_manifest(self, repo: &Path) -> Result<DependencyManifest> {
        match self {
            Self::Python => python::read_manifest(repo),
            Self::JavaScript => javascript::read_manifest(repo),
            Self::Go => go::read_manifest(repo),
            Self::Rust => rust::read_manifest(repo),
        }
    }

    /// 1-based line before which a new import statement belongs in `source`.
    pub fn import_insertion_line(self, source: &str) -> usize {
        match self {
            Self::Python => python::import_insertion_line(source),
            Self::JavaScript => javascript::import_insertion_line(source),
            Self::Go => go::import_insertion_line(source),
            Self::Rust => rust::import_insertion_line(source),
        }
    }
}

/// Runtime, framework and command chosen for a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRuntime {
    pub runtime: LanguageRuntime,
    pub framework: TestFramework,
    pub command: TestCommand,
    /// Whether JavaScript sources use ES modules.
    #[serde(default)]
    pub esm: bool,
}

impl ResolvedRuntime {
    /// Detect the ecosystem and framework of `repo`. An explicit command
    /// replaces the framework default but keeps the detected parser.
    pub fn resolve(repo: &Path, command_override: Option<TestCommand>) -> Result<Self> {
        let runtime = detect_language(repo)?.ok_or_else(|| {
            PatcherError::unrecoverable(format!(
                "no supported language runtime detected in {}",
                repo.display()
            ))
        })?;
        let framework = runtime.detect_framework(repo);
        let command = command_override.unwrap_or_else(|| runtime.build_test_command(framework));
        let esm = runtime == LanguageRuntime::JavaScript && javascript::is_esm(repo);
        tracing::info!(%runtime, %framework, command = %command, "resolved language runtime");
        Ok(Self {
            runtime,
            framework,
            command,
            esm,
        })
    }

    pub fn parse_output(&self, stdout: &str, stderr: &str, exit_code: Option<i32>) -> TestExecutionResult {
        self.runtime
            .parse_output(self.framework, stdout, stderr, exit_code)
    }

    pub fn suggest_imports(&self, error_message: &str, context: &ImportContext) -> Vec<ImportSuggestion> {
        let mut context = context.clone();
        context.esm |= self.esm;
        self.runtime.suggest_imports(error_message, &context)
    }
}

/// What kind of fix a suggestion proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Add an import statement to the failing file.
    Import,
    /// Install a missing package.
    Install,
    /// Remove an unused import.
    Remove,
}

/// One candidate fix for an unresolved identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSuggestion {
    pub symbol: String,
    pub statement: String,
    pub kind: SuggestionKind,
    pub confidence: f64,
    pub reason: String,
}

impl ImportSuggestion {
    pub fn import(symbol: &str, statement: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            statement: statement.into(),
            kind: SuggestionKind::Import,
            confidence,
            reason: reason.into(),
        }
    }

    pub fn install(symbol: &str, statement: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            kind: SuggestionKind::Install,
            ..Self::import(symbol, statement, confidence, reason)
        }
    }

    pub fn remove(symbol: &str, statement: impl Into<String>, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            kind: SuggestionKind::Remove,
            ..Self::import(symbol, statement, confidence, reason)
        }
    }
}

/// Repository facts that sharpen suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportContext {
    /// Importable local module names (e.g. `user_service`, `utils`).
    #[serde(default)]
    pub local_modules: Vec<String>,
    /// Declared dependency names.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub esm: bool,
    pub max_suggestions: usize,
}

impl Default for ImportContext {
    fn default() -> Self {
        Self {
            local_modules: Vec::new(),
            dependencies: Vec::new(),
            esm: false,
            max_suggestions: 3,
        }
    }
}

impl ImportContext {
    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

fn rank_suggestions(mut suggestions: Vec<ImportSuggestion>, limit: usize) -> Vec<ImportSuggestion> {
    suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut ranked: Vec<ImportSuggestion> = Vec::new();
    for s in suggestions {
        if !ranked.iter().any(|r| r.statement == s.statement) {
            ranked.push(s);
        }
    }
    ranked.truncate(limit.max(1));
    ranked
}

/// A declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_req: Option<String>,
    #[serde(default)]
    pub dev: bool,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version_req: Option<String>, dev: bool) -> Self {
        Self {
            name: name.into(),
            version_req: version_req.filter(|v| !v.is_empty()),
            dev,
        }
    }
}

/// Dependencies and toolchain facts read from a repository's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub runtime: LanguageRuntime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    /// Module or package name declared by the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub dependencies: Vec<Dependency>,
}

impl DependencyManifest {
    pub fn empty(runtime: LanguageRuntime) -> Self {
        Self {
            runtime,
            manifest_path: None,
            package_manager: None,
            language_version: None,
            project_name: None,
            dependencies: Vec::new(),
        }
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.name.clone()).collect()
    }
}

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI_ESCAPE regex should compile")
});

/// Remove terminal colour and cursor sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Reconcile counts with parsed failures so a non-zero exit is never green.
fn finalize(mut result: TestExecutionResult, exit_code: Option<i32>) -> TestExecutionResult {
    result.exit_code = exit_code;
    let parsed = result.failures.len() as u32;
    if parsed > result.failed {
        result.failed = parsed;
    }
    if result.failures.is_empty() {
        if result.failed > 0 {
            result.failures.push(TestFailure::new(
                format!("{} (unparsed)", result.framework),
                FailureKind::Error,
                format!("{} tests failed but no details could be parsed", result.failed),
            ));
        } else if exit_code != Some(0) {
            let message = match exit_code {
                Some(code) => format!("test runner exited with code {code} without reporting failures"),
                None => "test runner terminated by a signal".to_string(),
            };
            result
                .failures
                .push(TestFailure::new(format!("{} (runner)", result.framework), FailureKind::Setup, message));
            result.failed = result.failed.max(1);
        }
    }
    result
}

/// Read a file from the repository root if it exists.
fn read_optional(repo: &Path, name: &str) -> Result<Option<String>> {
    let path = repo.join(name);
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(std::fs::read_to_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mFAIL\x1b[0m src/a.test.js"), "FAIL src/a.test.js");
        assert_eq!(strip_ansi("\x1b[1m\x1b[32m✓\x1b[39m\x1b[22m ok"), "✓ ok");
    }

    #[test]
    fn test_finalize_nonzero_exit_is_never_green() {
        let result = finalize(TestExecutionResult::new(TestFramework::Pytest), Some(4));
        assert!(!result.is_green());
        assert_eq!(result.failures[0].kind, FailureKind::Setup);

        let signal = finalize(TestExecutionResult::new(TestFramework::GoTest), None);
        assert!(!signal.is_green());

        let clean = finalize(TestExecutionResult::new(TestFramework::GoTest), Some(0));
        assert!(clean.is_green());
    }

    #[test]
    fn test_finalize_reconciles_counts() {
        let mut r = TestExecutionResult::new(TestFramework::Jest);
        r.failed = 2;
        let r = finalize(r, Some(1));
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failed, 2);
    }

    #[test]
    fn test_rank_suggestions_dedupes_and_truncates() {
        let s = vec![
            ImportSuggestion::import("a", "import a", 0.5, "x"),
            ImportSuggestion::import("b", "import b", 0.9, "x"),
            ImportSuggestion::import("a", "import a", 0.7, "dup"),
            ImportSuggestion::import("c", "import c", 0.1, "x"),
        ];
        let ranked = rank_suggestions(s, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].statement, "import b");
        assert_eq!(ranked[1].statement, "import a");
        assert_eq!(ranked[1].confidence, 0.7);
    }
}
