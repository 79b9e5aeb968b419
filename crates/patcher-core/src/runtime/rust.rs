//! Cargo: libtest output, rustc diagnostics and `Cargo.toml`.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::{read_optional, Dependency, DependencyManifest, ImportContext, ImportSuggestion, LanguageRuntime, TestCommand};
use crate::domain::{FailureKind, PatcherError, Result, TestExecutionResult, TestFailure, TestFramework};

pub const MANIFESTS: &[&str] = &["Cargo.toml"];

pub fn detect_framework(repo: &Path) -> TestFramework {
    if repo.join("Cargo.toml").is_file() {
        TestFramework::CargoTest
    } else {
        TestFramework::Unknown
    }
}

pub fn test_command(_framework: TestFramework) -> TestCommand {
    TestCommand::new("cargo", &["test", "--no-fail-fast", "--color", "never"])
}

static TEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (.+?) \.\.\. (ok|FAILED|ignored)").expect("TEST_LINE regex should compile")
});

static STDOUT_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^---- (.+?) stdout ----$").expect("STDOUT_HEADER regex should compile")
});

/// `panicked at src/lib.rs:21:9:` with the message on the next line.
static PANIC_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"panicked at (\S+?):(\d+):\d+:$").expect("PANIC_AT regex should compile")
});

/// Older toolchains: `panicked at 'message', src/lib.rs:30:37`.
static PANIC_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"panicked at '(.*)', (\S+?):(\d+):\d+$").expect("PANIC_QUOTED regex should compile")
});

static TEST_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored")
        .expect("TEST_RESULT regex should compile")
});

static COMPILE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^error(?:\[(E\d{4})\])?: (.+)$").expect("COMPILE_ERROR regex should compile")
});

static SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*--> (\S+?):(\d+):\d+$").expect("SPAN regex should compile")
});

fn panic_failure(name: &str, body: &[&str]) -> TestFailure {
    for (idx, line) in body.iter().enumerate() {
        if let Some(caps) = PANIC_QUOTED.captures(line) {
            return classify(name, &caps[1]).at(&caps[2], caps[3].parse().ok());
        }
        if let Some(caps) = PANIC_AT.captures(line) {
            let message = body[idx + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .unwrap_or("panicked");
            return classify(name, message).at(&caps[1], caps[2].parse().ok());
        }
    }
    TestFailure::new(name, FailureKind::Panic, "test failed without a panic message")
}

fn classify(name: &str, message: &str) -> TestFailure {
    let kind = if message.starts_with("assertion") {
        FailureKind::Assertion
    } else {
        FailureKind::Panic
    };
    TestFailure::new(name, kind, message).with_error_type("panic")
}

pub fn parse_output(stdout: &str, stderr: &str, _exit_code: Option<i32>) -> TestExecutionResult {
    let text = format!("{stdout}\n{stderr}");
    let lines: Vec<&str> = text.lines().collect();
    let mut result = TestExecutionResult::new(TestFramework::CargoTest);

    let mut failed_tests: Vec<String> = Vec::new();
    let mut bodies: Vec<(String, Vec<&str>)> = Vec::new();
    let mut in_body = false;
    let mut pending_error: Option<(Option<String>, String)> = None;
    let mut could_not_compile: Option<String> = None;

    for &line in &lines {
        if let Some(caps) = TEST_LINE.captures(line) {
            if &caps[2] == "FAILED" {
                failed_tests.push(caps[1].to_string());
            }
            continue;
        }
        if let Some(caps) = TEST_RESULT.captures(line) {
            result.passed += caps[1].parse::<u32>().unwrap_or(0);
            result.skipped += caps[3].parse::<u32>().unwrap_or(0);
            in_body = false;
            continue;
        }
        if let Some(caps) = STDOUT_HEADER.captures(line) {
            bodies.push((caps[1].to_string(), Vec::new()));
            in_body = true;
            continue;
        }
        if line.trim() == "failures:" {
            in_body = false;
            continue;
        }
        if in_body {
            if let Some((_, body)) = bodies.last_mut() {
                body.push(line);
            }
            continue;
        }
        if let Some(caps) = COMPILE_ERROR.captures(line) {
            let message = caps[2].to_string();
            if message.starts_with("could not compile") {
                could_not_compile = Some(message);
            } else {
                pending_error = Some((caps.get(1).map(|m| m.as_str().to_string()), message));
            }
            continue;
        }
        if let Some(caps) = SPAN.captures(line) {
            if let Some((code, message)) = pending_error.take() {
                let file = caps[1].to_string();
                let line_no: u32 = caps[2].parse().unwrap_or(0);
                let mut failure =
                    TestFailure::new(format!("build {file}:{line_no}"), FailureKind::Build, message).at(file, Some(line_no));
                failure.error_type = code;
                result.failures.push(failure);
            }
        }
    }

    for name in &failed_tests {
        let failure = match bodies.iter().find(|(test, _)| test == name) {
            Some((_, body)) => panic_failure(name, body),
            None => TestFailure::new(name.as_str(), FailureKind::Panic, "test failed"),
        };
        result.failures.push(failure);
    }

    if let Some(message) = could_not_compile {
        if !result.failures.iter().any(|f| f.kind == FailureKind::Build) {
            result.failures.push(TestFailure::new("build", FailureKind::Build, message));
        }
    }

    result.failed = result.failures.len() as u32;
    result
}

/// std items by the name rustc reports as unresolved.
const STD_ITEMS: &[(&str, &str)] = &[
    ("HashMap", "std::collections::HashMap"),
    ("HashSet", "std::collections::HashSet"),
    ("BTreeMap", "std::collections::BTreeMap"),
    ("BTreeSet", "std::collections::BTreeSet"),
    ("VecDeque", "std::collections::VecDeque"),
    ("BinaryHeap", "std::collections::BinaryHeap"),
    ("Arc", "std::sync::Arc"),
    ("Mutex", "std::sync::Mutex"),
    ("RwLock", "std::sync::RwLock"),
    ("Rc", "std::rc::Rc"),
    ("RefCell", "std::cell::RefCell"),
    ("Cell", "std::cell::Cell"),
    ("Path", "std::path::Path"),
    ("PathBuf", "std::path::PathBuf"),
    ("Duration", "std::time::Duration"),
    ("Instant", "std::time::Instant"),
    ("Ordering", "std::cmp::Ordering"),
    ("FromStr", "std::str::FromStr"),
    ("Display", "std::fmt::Display"),
    ("Read", "std::io::Read"),
    ("Write", "std::io::Write"),
    ("BufRead", "std::io::BufRead"),
    ("BufReader", "std::io::BufReader"),
    ("File", "std::fs::File"),
];

const STD_MODULES: &[&str] = &["fmt", "fs", "io", "env", "mem", "cmp", "iter", "thread", "process", "time"];

static UNRESOLVED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:cannot find (?:type|function|value|struct|trait|macro) `(\w+)`|use of undeclared type `(\w+)`|use of undeclared crate or module `(\w+)`|unresolved import `(\w+)`)",
    )
    .expect("UNRESOLVED regex should compile")
});

/// rustc's own `help: consider importing` lines.
static RUSTC_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\s*\+\s*(use [\w:{}, ]+;)\s*$").expect("RUSTC_HINT regex should compile")
});

pub fn suggest_imports(error_message: &str, context: &ImportContext) -> Vec<ImportSuggestion> {
    let mut out = Vec::new();

    for caps in RUSTC_HINT.captures_iter(error_message) {
        let statement = &caps[1];
        let symbol = statement
            .trim_end_matches(';')
            .rsplit("::")
            .next()
            .unwrap_or(statement);
        out.push(ImportSuggestion::import(symbol, statement, 0.97, "suggested by rustc"));
    }

    for caps in UNRESOLVED.captures_iter(error_message) {
        let Some(name) = caps.iter().skip(1).flatten().next().map(|m| m.as_str()) else {
            continue;
        };
        if let Some((_, path)) = STD_ITEMS.iter().find(|(item, _)| *item == name) {
            out.push(ImportSuggestion::import(name, format!("use {path};"), 0.95, "standard library item"));
            continue;
        }
        if STD_MODULES.contains(&name) {
            out.push(ImportSuggestion::import(name, format!("use std::{name};"), 0.9, "standard library module"));
            continue;
        }
        if context.local_modules.iter().any(|m| m == name) {
            out.push(ImportSuggestion::import(name, format!("use crate::{name};"), 0.6, "module in this crate"));
            continue;
        }
        let is_crate_path = caps.get(3).is_some() || caps.get(4).is_some();
        if is_crate_path {
            let crate_name = name.replace('_', "-");
            if context.has_dependency(name) || context.has_dependency(&crate_name) {
                continue;
            }
            out.push(ImportSuggestion::install(
                name,
                format!("cargo add {name}"),
                0.5,
                "crate not declared in Cargo.toml",
            ));
        }
    }

    out
}

/// After crate-level docs and inner attributes.
pub fn import_insertion_line(source: &str) -> usize {
    let skipped = source
        .lines()
        .take_while(|l| {
            let t = l.trim_start();
            t.starts_with("//!") || t.starts_with("#![") || (t.starts_with("//") && !t.starts_with("///"))
        })
        .count();
    skipped + 1
}

pub fn read_manifest(repo: &Path) -> Result<DependencyManifest> {
    let mut manifest = DependencyManifest::empty(LanguageRuntime::Rust);
    manifest.package_manager = Some("cargo".into());
    let Some(text) = read_optional(repo, "Cargo.toml")? else {
        return Ok(manifest);
    };
    let doc: toml::Value = toml::from_str(&text).map_err(|e| PatcherError::Manifest {
        path: "Cargo.toml".into(),
        reason: e.to_string(),
    })?;
    manifest.manifest_path = Some("Cargo.toml".into());
    if let Some(package) = doc.get("package") {
        manifest.project_name = package.get("name").and_then(|v| v.as_str()).map(str::to_string);
        manifest.language_version = package
            .get("rust-version")
            .or_else(|| package.get("edition"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    for (section, dev) in [("dependencies", false), ("dev-dependencies", true)] {
        let Some(table) = doc.get(section).and_then(|v| v.as_table()) else {
            continue;
        };
        for (name, value) in table {
            let version = value
                .as_str()
                .or_else(|| value.get("version").and_then(|v| v.as_str()))
                .map(str::to_string);
            manifest.dependencies.push(Dependency::new(name, version, dev));
        }
    }
    Ok(manifest)
}
