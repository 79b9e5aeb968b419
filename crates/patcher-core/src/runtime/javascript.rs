//! Node ecosystem: jest, vitest and mocha reporters plus `package.json`.

use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

use super::{read_optional, Dependency, DependencyManifest, ImportContext, ImportSuggestion, LanguageRuntime, TestCommand};
use crate::domain::{FailureKind, PatcherError, Result, TestExecutionResult, TestFailure, TestFramework};

pub const MANIFESTS: &[&str] = &["package.json"];

const CONFIG_MARKERS: &[(&str, TestFramework)] = &[
    ("vitest.config.ts", TestFramework::Vitest),
    ("vitest.config.js", TestFramework::Vitest),
    ("vitest.config.mts", TestFramework::Vitest),
    ("jest.config.js", TestFramework::Jest),
    ("jest.config.ts", TestFramework::Jest),
    ("jest.config.cjs", TestFramework::Jest),
    ("jest.config.mjs", TestFramework::Jest),
    (".mocharc.json", TestFramework::Mocha),
    (".mocharc.yml", TestFramework::Mocha),
    (".mocharc.js", TestFramework::Mocha),
    (".mocharc.cjs", TestFramework::Mocha),
];

fn read_package_json(repo: &Path) -> Result<Option<Value>> {
    let Some(text) = read_optional(repo, "package.json")? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| PatcherError::Manifest {
            path: "package.json".into(),
            reason: e.to_string(),
        })
}

fn declares(pkg: &Value, name: &str) -> bool {
    ["dependencies", "devDependencies"]
        .iter()
        .any(|section| pkg.get(section).and_then(|d| d.get(name)).is_some())
}

pub fn detect_framework(repo: &Path) -> TestFramework {
    if let Some((_, framework)) = CONFIG_MARKERS.iter().find(|(file, _)| repo.join(file).is_file()) {
        return *framework;
    }
    let Ok(Some(pkg)) = read_package_json(repo) else {
        return TestFramework::Unknown;
    };
    let script = pkg
        .get("scripts")
        .and_then(|s| s.get("test"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    for (name, framework) in [
        ("vitest", TestFramework::Vitest),
        ("jest", TestFramework::Jest),
        ("mocha", TestFramework::Mocha),
    ] {
        if declares(&pkg, name) || script.contains(name) {
            return framework;
        }
    }
    TestFramework::Unknown
}

pub fn test_command(framework: TestFramework) -> TestCommand {
    match framework {
        TestFramework::Jest => TestCommand::new("npx", &["jest", "--ci"]),
        TestFramework::Vitest => TestCommand::new("npx", &["vitest", "run"]),
        TestFramework::Mocha => TestCommand::new("npx", &["mocha"]),
        _ => TestCommand::new("npm", &["test", "--silent"]),
    }
}

/// Whether `package.json` declares ES module sources.
pub fn is_esm(repo: &Path) -> bool {
    matches!(
        read_package_json(repo),
        Ok(Some(pkg)) if pkg.get("type").and_then(Value::as_str) == Some("module")
    )
}

/// Guess the reporter when the command was a bare `npm test`.
fn sniff(text: &str) -> TestFramework {
    if text.contains("Test Suites:") {
        TestFramework::Jest
    } else if text.contains("Test Files ") || text.contains(" RUN  v") {
        TestFramework::Vitest
    } else if MOCHA_COUNT.is_match(text) {
        TestFramework::Mocha
    } else {
        TestFramework::Unknown
    }
}

pub fn parse_output(framework: TestFramework, stdout: &str, stderr: &str, _exit_code: Option<i32>) -> TestExecutionResult {
    let text = format!("{stdout}\n{stderr}");
    let framework = match framework {
        TestFramework::Jest | TestFramework::Vitest | TestFramework::Mocha => framework,
        _ => sniff(&text),
    };
    let lines: Vec<&str> = text.lines().collect();
    match framework {
        TestFramework::Jest => parse_jest(&lines),
        TestFramework::Vitest => parse_vitest(&lines),
        TestFramework::Mocha => parse_mocha(&lines),
        other => TestExecutionResult::new(other),
    }
}

static JS_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:[A-Za-z_$][\w$]*\.)*[A-Za-z_$][\w$]*Error)(?: \[\w+\])?:\s*(.*)$")
        .expect("JS_ERROR regex should compile")
});

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^at (?:.*? \()?([^\s()]+):(\d+):\d+\)?$").expect("STACK_FRAME regex should compile")
});

static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (failed|passed|skipped|todo|pending)").expect("COUNT regex should compile")
});

fn apply_counts(result: &mut TestExecutionResult, summary: &str) {
    for caps in COUNT.captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "failed" => result.failed = n,
            "passed" => result.passed = n,
            _ => result.skipped += n,
        }
    }
}

/// First stack frame that points into the project rather than a dependency.
fn project_location<'a>(lines: impl IntoIterator<Item = &'a str>, pattern: &Regex) -> Option<(String, u32)> {
    lines.into_iter().find_map(|line| {
        let caps = pattern.captures(line.trim())?;
        let file = &caps[1];
        if file.contains("node_modules") || file.starts_with("node:") {
            return None;
        }
        Some((file.trim_start_matches("./").to_string(), caps[2].parse().ok()?))
    })
}

/// Build a failure from the body lines that follow a block header.
fn failure_from_body(name: String, setup: bool, body: &[&str], frame: &Regex) -> TestFailure {
    let message = body
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let (error_type, message) = match JS_ERROR.captures(message) {
        Some(caps) => (Some(caps[1].to_string()), caps[2].to_string()),
        None if message.starts_with("expect(") => (Some("AssertionError".to_string()), message.to_string()),
        None => (None, message.to_string()),
    };
    let kind = if setup {
        FailureKind::Setup
    } else if matches!(error_type.as_deref(), Some("AssertionError")) {
        FailureKind::Assertion
    } else {
        FailureKind::Error
    };
    let mut failure = TestFailure::new(name, kind, message);
    failure.error_type = error_type;
    let (file, line) = match project_location(body.iter().copied(), frame) {
        Some((file, line)) => (Some(file), Some(line)),
        None => (None, None),
    };
    failure.file = file;
    failure.line = line;
    failure
}

/// Suite or file, test title (absent for suite-level errors), body lines.
type Pending<'a> = (String, Option<String>, Vec<&'a str>);

static JEST_SUITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(FAIL|PASS)\s+(\S+)").expect("JEST_SUITE regex should compile")
});

static JEST_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*● (.+)$").expect("JEST_BLOCK regex should compile"));

fn parse_jest(lines: &[&str]) -> TestExecutionResult {
    let mut result = TestExecutionResult::new(TestFramework::Jest);
    let mut suite = String::new();
    let mut current: Option<Pending<'_>> = None;

    fn flush(current: &mut Option<Pending<'_>>, result: &mut TestExecutionResult) {
        if let Some((suite, title, body)) = current.take() {
            let setup = title.as_deref().map_or(true, |t| t == "Test suite failed to run");
            let name = match title.filter(|_| !setup) {
                Some(title) => format!("{suite}::{title}"),
                None => suite.clone(),
            };
            let mut failure = failure_from_body(name, setup, &body, &STACK_FRAME);
            if failure.file.is_none() && !suite.is_empty() {
                failure.file = Some(suite);
            }
            result.failures.push(failure);
        }
    }

    for line in lines {
        if let Some(caps) = JEST_SUITE.captures(line) {
            flush(&mut current, &mut result);
            suite = caps[2].to_string();
            continue;
        }
        if let Some(caps) = JEST_BLOCK.captures(line) {
            flush(&mut current, &mut result);
            current = Some((suite.clone(), Some(caps[1].trim().to_string()), Vec::new()));
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with("Test Suites:") {
            flush(&mut current, &mut result);
            continue;
        }
        if let Some(summary) = trimmed.strip_prefix("Tests:") {
            apply_counts(&mut result, summary);
            continue;
        }
        if let Some((_, _, body)) = current.as_mut() {
            body.push(line);
        }
    }
    flush(&mut current, &mut result);
    result
}

static VITEST_FAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*FAIL\s+(\S+)(.*)$").expect("VITEST_FAIL regex should compile")
});

static VITEST_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^❯ (?:\S+ )?([^\s:]+):(\d+):\d+$").expect("VITEST_FRAME regex should compile")
});

fn parse_vitest(lines: &[&str]) -> TestExecutionResult {
    let mut result = TestExecutionResult::new(TestFramework::Vitest);
    let mut current: Option<Pending<'_>> = None;

    fn flush(current: &mut Option<Pending<'_>>, result: &mut TestExecutionResult) {
        if let Some((file, title, body)) = current.take() {
            let setup = title.is_none();
            let name = match &title {
                Some(title) => format!("{file}::{title}"),
                None => file.clone(),
            };
            let mut failure = failure_from_body(name, setup, &body, &VITEST_FRAME);
            if failure.file.is_none() {
                failure.file = Some(file);
            }
            result.failures.push(failure);
        }
    }

    for line in lines {
        let trimmed = line.trim();
        if let Some(caps) = VITEST_FAIL.captures(line) {
            flush(&mut current, &mut result);
            let title = caps[2]
                .trim()
                .strip_prefix('>')
                .map(|t| t.trim().to_string());
            current = Some((caps[1].to_string(), title, Vec::new()));
            continue;
        }
        if trimmed.starts_with('⎯') || trimmed.starts_with("Test Files") {
            flush(&mut current, &mut result);
            continue;
        }
        if let Some(summary) = trimmed.strip_prefix("Tests ") {
            apply_counts(&mut result, summary);
            continue;
        }
        if let Some((_, _, body)) = current.as_mut() {
            body.push(line);
        }
    }
    flush(&mut current, &mut result);
    result
}

static MOCHA_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\d+) (passing|failing|pending)\b").expect("MOCHA_COUNT regex should compile")
});

static MOCHA_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\) (.+)$").expect("MOCHA_BLOCK regex should compile"));

fn parse_mocha(lines: &[&str]) -> TestExecutionResult {
    let mut result = TestExecutionResult::new(TestFramework::Mocha);
    let mut failing_section = false;
    // (title parts, title complete, body)
    let mut blocks: Vec<(Vec<String>, bool, Vec<&str>)> = Vec::new();

    for line in lines {
        if let Some(caps) = MOCHA_COUNT.captures(line) {
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passing" => result.passed = n,
                "failing" => {
                    result.failed = n;
                    failing_section = true;
                }
                _ => result.skipped = n,
            }
            continue;
        }
        if !failing_section {
            continue;
        }
        if let Some(caps) = MOCHA_BLOCK.captures(line) {
            let head = caps[1].trim();
            let complete = head.ends_with(':');
            blocks.push((vec![head.trim_end_matches(':').to_string()], complete, Vec::new()));
            continue;
        }
        let Some((title, complete, body)) = blocks.last_mut() else {
            continue;
        };
        if *complete {
            body.push(line);
        } else {
            let part = line.trim();
            *complete = part.ends_with(':');
            title.push(part.trim_end_matches(':').to_string());
        }
    }

    for (title, _, body) in blocks {
        let name = title.join(" ");
        result
            .failures
            .push(failure_from_body(name, false, &body, &STACK_FRAME));
    }
    result
}

const MATH_MEMBERS: &[&str] = &[
    "sqrt", "floor", "ceil", "round", "abs", "pow", "hypot", "trunc", "sign", "log", "exp", "PI",
];

const NODE_MODULES: &[&str] = &[
    "fs", "path", "os", "util", "crypto", "events", "http", "https", "url", "assert", "stream", "zlib",
];

const NODE_NAMED: &[(&str, &str)] = &[
    ("readFileSync", "fs"),
    ("writeFileSync", "fs"),
    ("existsSync", "fs"),
    ("mkdirSync", "fs"),
    ("readdirSync", "fs"),
    ("join", "path"),
    ("resolve", "path"),
    ("basename", "path"),
    ("dirname", "path"),
    ("extname", "path"),
    ("promisify", "util"),
    ("inspect", "util"),
    ("randomUUID", "crypto"),
    ("createHash", "crypto"),
    ("EventEmitter", "events"),
    ("execSync", "child_process"),
    ("spawn", "child_process"),
    ("fileURLToPath", "url"),
];

static NOT_DEFINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z_$][\w$]*) is not defined").expect("NOT_DEFINED regex should compile")
});

static CANNOT_FIND_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Cannot find name '([\w$]+)'").expect("CANNOT_FIND_NAME regex should compile")
});

static CANNOT_FIND_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Cannot find (?:module|package) '([^']+)'").expect("CANNOT_FIND_MODULE regex should compile")
});

fn kebab_case(name: &str) -> String {
    let mut out = String::new();
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn named_import(symbol: &str, from: &str, esm: bool) -> String {
    if esm {
        format!("import {{ {symbol} }} from '{from}';")
    } else {
        format!("const {{ {symbol} }} = require('{from}');")
    }
}

pub fn suggest_imports(error_message: &str, context: &ImportContext) -> Vec<ImportSuggestion> {
    let mut out = Vec::new();
    let esm = context.esm;

    let mut symbols: Vec<&str> = NOT_DEFINED
        .captures_iter(error_message)
        .chain(CANNOT_FIND_NAME.captures_iter(error_message))
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    symbols.dedup();

    for name in symbols {
        if MATH_MEMBERS.contains(&name) {
            out.push(ImportSuggestion::import(
                name,
                format!("const {{ {name} }} = Math;"),
                0.6,
                "member of the Math global",
            ));
        }
        if NODE_MODULES.contains(&name) {
            let statement = if esm {
                format!("import {name} from 'node:{name}';")
            } else {
                format!("const {name} = require('{name}');")
            };
            out.push(ImportSuggestion::import(name, statement, 0.9, "node builtin module"));
        }
        if let Some((_, module)) = NODE_NAMED.iter().find(|(sym, _)| *sym == name) {
            let from = if esm { format!("node:{module}") } else { module.to_string() };
            out.push(ImportSuggestion::import(name, named_import(name, &from, esm), 0.85, "node builtin export"));
        }
        let candidates = [name.to_string(), name.to_lowercase(), kebab_case(name)];
        if let Some(module) = context.local_modules.iter().find(|m| candidates.contains(m)) {
            out.push(ImportSuggestion::import(
                name,
                named_import(name, &format!("./{module}"), esm),
                0.5,
                "local module with matching name",
            ));
        }
        if context.has_dependency(name) {
            out.push(ImportSuggestion::import(
                name,
                if esm {
                    format!("import {name} from '{name}';")
                } else {
                    format!("const {name} = require('{name}');")
                },
                0.7,
                "declared dependency",
            ));
        }
    }

    for caps in CANNOT_FIND_MODULE.captures_iter(error_message) {
        let spec = &caps[1];
        if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
            continue;
        }
        let mut parts = spec.split('/');
        let package = match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) if scope.starts_with('@') => format!("{scope}/{name}"),
            (Some(name), _) => name.to_string(),
            _ => continue,
        };
        if NODE_MODULES.contains(&package.as_str()) {
            continue;
        }
        let confidence = if context.has_dependency(&package) { 0.3 } else { 0.6 };
        out.push(ImportSuggestion::install(
            &package,
            format!("npm install {package}"),
            confidence,
            "package not installed",
        ));
    }

    out
}

/// After a shebang, leading comments and a `use strict` directive.
pub fn import_insertion_line(source: &str) -> usize {
    let lines: Vec<&str> = source.lines().collect();
    let mut idx = 0;
    let mut in_block = false;
    while idx < lines.len() {
        let t = lines[idx].trim();
        if in_block {
            in_block = !t.contains("*/");
        } else if t.starts_with("/*") {
            in_block = !t.contains("*/");
        } else if !(t.starts_with("#!")
            || t.starts_with("//")
            || t.trim_end_matches(';').trim_matches(['\'', '"']) == "use strict")
        {
            break;
        }
        idx += 1;
    }
    idx + 1
}

pub fn read_manifest(repo: &Path) -> Result<DependencyManifest> {
    let mut manifest = DependencyManifest::empty(LanguageRuntime::JavaScript);
    manifest.package_manager = Some(
        if repo.join("pnpm-lock.yaml").is_file() {
            "pnpm"
        } else if repo.join("yarn.lock").is_file() {
            "yarn"
        } else if repo.join("bun.lockb").is_file() {
            "bun"
        } else {
            "npm"
        }
        .to_string(),
    );
    let Some(pkg) = read_package_json(repo)? else {
        return Ok(manifest);
    };
    manifest.manifest_path = Some("package.json".into());
    manifest.project_name = pkg.get("name").and_then(Value::as_str).map(str::to_string);
    manifest.language_version = pkg
        .get("engines")
        .and_then(|e| e.get("node"))
        .and_then(Value::as_str)
        .map(str::to_string);
    for (section, dev) in [("dependencies", false), ("devDependencies", true)] {
        let Some(deps) = pkg.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (name, version) in deps {
            manifest.dependencies.push(Dependency::new(
                name,
                version.as_str().map(str::to_string),
                dev,
            ));
        }
    }
    Ok(manifest)
}
