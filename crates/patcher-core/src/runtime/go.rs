//! Go toolchain: `go test -v` output, build errors and `go.mod`.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use super::detect::is_ignored;
use super::{read_optional, Dependency, DependencyManifest, ImportContext, ImportSuggestion, LanguageRuntime, TestCommand};
use crate::domain::{FailureKind, Result, TestExecutionResult, TestFailure, TestFramework};

pub const MANIFESTS: &[&str] = &["go.mod"];

pub fn detect_framework(repo: &Path) -> TestFramework {
    if repo.join("go.mod").is_file() {
        return TestFramework::GoTest;
    }
    let has_tests = WalkDir::new(repo)
        .max_depth(5)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().ends_with("_test.go"));
    if has_tests {
        TestFramework::GoTest
    } else {
        TestFramework::Unknown
    }
}

pub fn test_command(_framework: TestFramework) -> TestCommand {
    TestCommand::new("go", &["test", "-v", "-count=1", "./..."])
}

static RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=== (?:RUN|CONT)\s+(\S+)").expect("RUN regex should compile")
});

static STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*--- (FAIL|PASS|SKIP): (\S+)").expect("STATUS regex should compile")
});

static TEST_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+(\S+\.go):(\d+): (.*)$").expect("TEST_LOG regex should compile")
});

static BUILD_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+\.go):(\d+):(?:\d+:)? (.+)$").expect("BUILD_ERROR regex should compile")
});

static PANIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^panic: (.+)$").expect("PANIC regex should compile"));

static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\t(\S+\.go):(\d+)").expect("FRAME regex should compile"));

fn is_toolchain_frame(file: &str) -> bool {
    file.contains("/src/runtime/") || file.contains("/src/testing/")
}

pub fn parse_output(stdout: &str, stderr: &str, _exit_code: Option<i32>) -> TestExecutionResult {
    let text = format!("{stdout}\n{stderr}");
    let mut result = TestExecutionResult::new(TestFramework::GoTest);

    let mut current: Option<String> = None;
    let mut logs: HashMap<String, (String, u32, String)> = HashMap::new();
    let mut failed: Vec<String> = Vec::new();
    let mut panic: Option<(String, String)> = None;
    let mut panic_frame: Option<(String, u32)> = None;

    for line in text.lines() {
        if let Some(caps) = RUN.captures(line) {
            current = Some(caps[1].to_string());
            continue;
        }
        if let Some(caps) = STATUS.captures(line) {
            let name = caps[2].to_string();
            match &caps[1] {
                "FAIL" => {
                    if !failed.contains(&name) {
                        failed.push(name.clone());
                    }
                    // Without -v the log lines follow the status line.
                    current = Some(name);
                }
                "PASS" => result.passed += 1,
                _ => result.skipped += 1,
            }
            continue;
        }
        if let Some(caps) = TEST_LOG.captures(line) {
            if let Some(test) = &current {
                logs.entry(test.clone()).or_insert_with(|| {
                    (caps[1].to_string(), caps[2].parse().unwrap_or(0), caps[3].trim().to_string())
                });
            }
            continue;
        }
        if let Some(caps) = PANIC.captures(line) {
            if panic.is_none() {
                let test = current.clone().unwrap_or_else(|| "panic".to_string());
                let message = caps[1].trim_end_matches(" [recovered]").to_string();
                panic = Some((test, message));
            }
            continue;
        }
        if panic.is_some() && panic_frame.is_none() {
            if let Some(caps) = FRAME.captures(line) {
                if !is_toolchain_frame(&caps[1]) {
                    panic_frame = Some((caps[1].to_string(), caps[2].parse().unwrap_or(0)));
                }
            }
            continue;
        }
        if let Some(caps) = BUILD_ERROR.captures(line) {
            let file = caps[1].trim_start_matches("./").to_string();
            let line_no: u32 = caps[2].parse().unwrap_or(0);
            result.failures.push(
                TestFailure::new(format!("build {file}:{line_no}"), FailureKind::Build, caps[3].trim())
                    .at(file, Some(line_no)),
            );
        }
    }

    if let Some((test, _)) = &panic {
        if !failed.contains(test) {
            failed.push(test.clone());
        }
    }

    // A parent fails whenever one of its subtests does; report the subtest.
    let leaves: Vec<&String> = failed
        .iter()
        .filter(|name| {
            let prefix = format!("{name}/");
            !failed.iter().any(|other| other.starts_with(&prefix))
        })
        .collect();

    for name in leaves {
        let failure = match (&panic, logs.get(name)) {
            (Some((test, message)), _) if test == name => {
                let failure = TestFailure::new(name.as_str(), FailureKind::Panic, message.as_str())
                    .with_error_type("panic");
                match &panic_frame {
                    Some((file, line)) => failure.at(file.as_str(), Some(*line)),
                    None => failure,
                }
            }
            (_, Some((file, line, message))) => {
                TestFailure::new(name.as_str(), FailureKind::Assertion, message.as_str()).at(file.as_str(), Some(*line))
            }
            (_, None) => TestFailure::new(name.as_str(), FailureKind::Assertion, "test failed"),
        };
        result.failures.push(failure);
    }

    result.failed = result.failures.len() as u32;
    result
}

/// Standard library packages by the identifier they are referenced with.
const STDLIB_PACKAGES: &[(&str, &str)] = &[
    ("fmt", "fmt"),
    ("strings", "strings"),
    ("strconv", "strconv"),
    ("os", "os"),
    ("errors", "errors"),
    ("time", "time"),
    ("math", "math"),
    ("sort", "sort"),
    ("bytes", "bytes"),
    ("io", "io"),
    ("bufio", "bufio"),
    ("sync", "sync"),
    ("context", "context"),
    ("regexp", "regexp"),
    ("log", "log"),
    ("reflect", "reflect"),
    ("unicode", "unicode"),
    ("testing", "testing"),
    ("json", "encoding/json"),
    ("hex", "encoding/hex"),
    ("base64", "encoding/base64"),
    ("http", "net/http"),
    ("url", "net/url"),
    ("filepath", "path/filepath"),
    ("rand", "math/rand"),
    ("atomic", "sync/atomic"),
    ("exec", "os/exec"),
    ("sha256", "crypto/sha256"),
];

/// Exported functions whose bare use usually means a missing qualifier.
const PACKAGE_FUNCTIONS: &[(&str, &str)] = &[
    ("Sprintf", "fmt"),
    ("Printf", "fmt"),
    ("Println", "fmt"),
    ("Errorf", "fmt"),
    ("Fprintf", "fmt"),
    ("Contains", "strings"),
    ("Split", "strings"),
    ("Join", "strings"),
    ("TrimSpace", "strings"),
    ("ToUpper", "strings"),
    ("ToLower", "strings"),
    ("Itoa", "strconv"),
    ("Atoi", "strconv"),
    ("Now", "time"),
];

static UNDEFINED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"undefined: (\w+)").expect("UNDEFINED regex should compile"));

static UNUSED_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)" imported and not used"#).expect("UNUSED_IMPORT regex should compile")
});

static MISSING_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:no required module provides package|cannot find package "?)\s*"?([\w./-]+?)"?(?:[;:]|\s|$)"#)
        .expect("MISSING_PACKAGE regex should compile")
});

pub fn suggest_imports(error_message: &str, _context: &ImportContext) -> Vec<ImportSuggestion> {
    let mut out = Vec::new();

    for caps in UNDEFINED.captures_iter(error_message) {
        let name = &caps[1];
        if let Some((_, path)) = STDLIB_PACKAGES.iter().find(|(ident, _)| *ident == name) {
            out.push(ImportSuggestion::import(name, format!("import \"{path}\""), 0.95, "standard library package"));
        }
        if let Some((_, pkg)) = PACKAGE_FUNCTIONS.iter().find(|(func, _)| *func == name) {
            out.push(ImportSuggestion::import(
                name,
                format!("import \"{pkg}\""),
                0.6,
                format!("{name} is exported by {pkg}"),
            ));
        }
    }

    for caps in UNUSED_IMPORT.captures_iter(error_message) {
        let path = &caps[1];
        out.push(ImportSuggestion::remove(path, format!("import \"{path}\""), 0.9, "import is unused"));
    }

    for caps in MISSING_PACKAGE.captures_iter(error_message) {
        let path = &caps[1];
        if !path.contains('.') {
            continue;
        }
        out.push(ImportSuggestion::install(path, format!("go get {path}"), 0.7, "module not in go.mod"));
    }

    out
}

/// Directly after the `package` clause.
pub fn import_insertion_line(source: &str) -> usize {
    source
        .lines()
        .position(|l| l.trim_start().starts_with("package "))
        .map(|idx| idx + 2)
        .unwrap_or(1)
}

pub fn read_manifest(repo: &Path) -> Result<DependencyManifest> {
    let mut manifest = DependencyManifest::empty(LanguageRuntime::Go);
    manifest.package_manager = Some("go".into());
    let Some(text) = read_optional(repo, "go.mod")? else {
        return Ok(manifest);
    };
    manifest.manifest_path = Some("go.mod".into());

    let mut in_require = false;
    for raw in text.lines() {
        let line = raw.split("//").next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if in_require {
            if line == ")" {
                in_require = false;
            } else if let Some(dep) = require_entry(line) {
                manifest.dependencies.push(dep);
            }
            continue;
        }
        if let Some(module) = line.strip_prefix("module ") {
            manifest.project_name = Some(module.trim().trim_matches('"').to_string());
        } else if let Some(version) = line.strip_prefix("go ") {
            manifest.language_version = Some(version.trim().to_string());
        } else if line == "require (" {
            in_require = true;
        } else if let Some(entry) = line.strip_prefix("require ") {
            manifest.dependencies.extend(require_entry(entry));
        }
    }
    Ok(manifest)
}

fn require_entry(line: &str) -> Option<Dependency> {
    let mut parts = line.split_whitespace();
    let path = parts.next()?;
    Some(Dependency::new(path, parts.next().map(str::to_string), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_undefined_package_suggests_stdlib_import() {
        let s = suggest_imports("./utils.go:6:9: undefined: fmt", &ImportContext::default());
        assert_eq!(s[0].statement, "import \"fmt\"");
        assert!(s[0].confidence > 0.9);
    }

    #[test]
    fn test_unqualified_function_suggests_package() {
        let s = suggest_imports("undefined: Sprintf", &ImportContext::default());
        assert_eq!(s[0].statement, "import \"fmt\"");
        assert!(s[0].confidence < 0.9);
    }

    #[test]
    fn test_unused_and_missing_packages() {
        let s = suggest_imports("./main.go:4:2: \"os\" imported and not used", &ImportContext::default());
        assert_eq!(s[0].kind, super::super::SuggestionKind::Remove);

        let s = suggest_imports(
            "main.go:5:2: no required module provides package github.com/google/uuid; to add it:",
            &ImportContext::default(),
        );
        assert_eq!(s[0].statement, "go get github.com/google/uuid");
    }

    #[test]
    fn test_insertion_after_package_clause() {
        let src = "package main\n\n// FormatMessage formats.\nfunc FormatMessage() {}\n";
        assert_eq!(import_insertion_line(src), 2);
        let src = "// Package utils.\npackage utils\n";
        assert_eq!(import_insertion_line(src), 3);
    }

    #[test]
    fn test_read_go_mod() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("go.mod"),
            "module example.com/utils\n\ngo 1.21\n\nrequire (\n\tgithub.com/google/uuid v1.6.0\n\tgolang.org/x/text v0.14.0 // indirect\n)\n\nrequire github.com/stretchr/testify v1.9.0\n",
        )
        .expect("write");
        let m = read_manifest(dir.path()).expect("manifest");
        assert_eq!(m.project_name.as_deref(), Some("example.com/utils"));
        assert_eq!(m.language_version.as_deref(), Some("1.21"));
        assert_eq!(
            m.dependency_names(),
            vec!["github.com/google/uuid", "golang.org/x/text", "github.com/stretchr/testify"]
        );
        assert_eq!(m.dependencies[1].version_req.as_deref(), Some("v0.14.0"));
    }

    #[test]
    fn test_non_verbose_output_attaches_logs_after_status() {
        let out = "--- FAIL: TestAdd (0.00s)\n    math_test.go:9: got 3, want 4\nFAIL\nFAIL\texample.com/m\t0.002s\n";
        let r = parse_output(out, "", Some(1));
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].message, "got 3, want 4");
        assert_eq!(r.failures[0].line, Some(9));
    }
}
