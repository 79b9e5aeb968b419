//! Normalized test-run results shared by every language runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Test framework a result was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    Pytest,
    Jest,
    Vitest,
    Mocha,
    GoTest,
    CargoTest,
    Unknown,
}

impl std::fmt::Display for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pytest => write!(f, "pytest"),
            Self::Jest => write!(f, "jest"),
            Self::Vitest => write!(f, "vitest"),
            Self::Mocha => write!(f, "mocha"),
            Self::GoTest => write!(f, "go_test"),
            Self::CargoTest => write!(f, "cargo_test"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classification of a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An assertion did not hold.
    Assertion,
    /// The test raised an error or exception other than an assertion.
    Error,
    /// A panic in compiled code.
    Panic,
    /// The code under test did not compile.
    Build,
    /// Collection, import or fixture setup failed.
    Setup,
}

impl FailureKind {
    /// Build and setup failures prevent assertions from running at all.
    pub fn blocks_execution(self) -> bool {
        matches!(self, Self::Build | Self::Setup)
    }
}

/// One structured failure extracted from runner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub kind: FailureKind,
    /// Language-level error type, e.g. `NameError` or `ReferenceError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl TestFailure {
    pub fn new(test_name: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            kind,
            error_type: None,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    /// Error type and message joined the way runners print them.
    pub fn error_text(&self) -> String {
        match &self.error_type {
            Some(t) if !self.message.starts_with(t.as_str()) => format!("{t}: {}", self.message),
            _ => self.message.clone(),
        }
    }
}

/// Result of one TEST invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub framework: TestFramework,
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    pub failures: Vec<TestFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TestExecutionResult {
    pub fn new(framework: TestFramework) -> Self {
        Self {
            framework,
            passed: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Zero failures of any kind.
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.failures.is_empty()
    }

    /// True when compilation or setup failed, so assertion results are absent.
    pub fn has_blocking_failure(&self) -> bool {
        self.failures.iter().any(|f| f.kind.blocks_execution())
    }

    /// Identifiers of failing tests, for failure-diff analysis.
    pub fn failing_set(&self) -> BTreeSet<String> {
        self.failures.iter().map(|f| f.test_name.clone()).collect()
    }

    /// Files referenced by failures, in first-seen order.
    pub fn failing_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for file in self.failures.iter().filter_map(|f| f.file.as_ref()) {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        files
    }
}
