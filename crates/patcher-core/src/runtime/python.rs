//! Python ecosystem: pytest output parsing, stdlib import suggestions and
//! requirements / pyproject manifests.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use super::detect::is_ignored;
use super::{read_optional, Dependency, DependencyManifest, ImportContext, ImportSuggestion, LanguageRuntime, TestCommand};
use crate::domain::{FailureKind, PatcherError, Result, TestExecutionResult, TestFailure, TestFramework};

pub const MANIFESTS: &[&str] = &[
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "Pipfile",
];

pub fn detect_framework(repo: &Path) -> TestFramework {
    if ["pytest.ini", "conftest.py", "tox.ini"]
        .iter()
        .any(|m| repo.join(m).is_file())
    {
        return TestFramework::Pytest;
    }
    let mentions = |file: &str, needle: &str| {
        read_optional(repo, file)
            .ok()
            .flatten()
            .map(|text| text.contains(needle))
            .unwrap_or(false)
    };
    if mentions("pyproject.toml", "pytest")
        || mentions("setup.cfg", "[tool:pytest]")
        || mentions("requirements.txt", "pytest")
        || mentions("requirements-dev.txt", "pytest")
    {
        return TestFramework::Pytest;
    }
    let has_tests = WalkDir::new(repo)
        .max_depth(5)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
        .filter_map(|e| e.ok())
        .any(|e| {
            let name = e.file_name().to_string_lossy();
            name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
        });
    if has_tests {
        TestFramework::Pytest
    } else {
        TestFramework::Unknown
    }
}

pub fn test_command(_framework: TestFramework) -> TestCommand {
    TestCommand::new(
        "python",
        &["-m", "pytest", "-v", "--tb=short", "-rfE", "--color=no", "-p", "no:cacheprovider"],
    )
}

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+ [a-z]+(?:, )?)+ in [\d.]+s").expect("SUMMARY_LINE regex should compile")
});

static SUMMARY_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (failed|passed|skipped|errors?|xfailed|xpassed)\b")
        .expect("SUMMARY_COUNT regex should compile")
});

static BLOCK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_{3,} (.+?) _{3,}$").expect("BLOCK_HEADER regex should compile")
});

static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+\.py):(\d+): (?:in \S+|[A-Za-z_]\w*)$").expect("LOCATION regex should compile")
});

static ERROR_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:[A-Za-z_]\w*\.)*[A-Za-z_]\w*(?:Error|Exception|Exit|Interrupt|Failed)):?\s*(.*)$")
        .expect("ERROR_TYPE regex should compile")
});

static SHORT_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$").expect("SHORT_SUMMARY regex should compile")
});

static VERBOSE_PASSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"::\S+ PASSED").expect("VERBOSE_PASSED regex should compile")
});

/// A `____ name ____` section of the FAILURES or ERRORS report.
#[derive(Debug, Default)]
struct Block {
    header: String,
    location: Option<(String, u32)>,
    error_lines: Vec<String>,
}

impl Block {
    /// Error type and message from the first `E` line.
    fn error(&self) -> Option<(Option<String>, String)> {
        let first = self.error_lines.first()?;
        Some(split_error(first))
    }

    fn matches_nodeid(&self, nodeid: &str) -> bool {
        let header = self.header.strip_prefix("ERROR collecting ").unwrap_or(&self.header);
        let header = header
            .strip_prefix("ERROR at setup of ")
            .or_else(|| header.strip_prefix("ERROR at teardown of "))
            .unwrap_or(header);
        nodeid == header
            || nodeid.ends_with(&format!("::{}", header.replace('.', "::")))
            || nodeid.ends_with(&format!("::{header}"))
    }
}

fn split_error(text: &str) -> (Option<String>, String) {
    let text = text.trim();
    match ERROR_TYPE.captures(text) {
        Some(caps) => (
            Some(caps[1].to_string()),
            caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ),
        None if text.starts_with("assert") => (Some("AssertionError".to_string()), text.to_string()),
        None => (None, text.to_string()),
    }
}

fn collect_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    for line in lines {
        let trimmed = line.trim_end();
        if let Some(caps) = BLOCK_HEADER.captures(trimmed) {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            current = Some(Block {
                header: caps[1].trim().to_string(),
                ..Block::default()
            });
            continue;
        }
        if trimmed.starts_with("===") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            continue;
        }
        let Some(block) = current.as_mut() else {
            continue;
        };
        if let Some(caps) = LOCATION.captures(trimmed) {
            block.location = Some((caps[1].to_string(), caps[2].parse().unwrap_or(0)));
        } else if let Some(rest) = trimmed.strip_prefix("E ") {
            block.error_lines.push(rest.trim().to_string());
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn build_failure(name: &str, is_error: bool, summary: Option<&str>, block: Option<&Block>) -> TestFailure {
    let (error_type, message) = block
        .and_then(Block::error)
        .or_else(|| summary.map(split_error))
        .unwrap_or((None, String::new()));
    let kind = if is_error {
        FailureKind::Setup
    } else if error_type.as_deref() == Some("AssertionError") {
        FailureKind::Assertion
    } else {
        FailureKind::Error
    };
    let mut failure = TestFailure::new(name, kind, message);
    failure.error_type = error_type;
    match block.and_then(|b| b.location.clone()) {
        Some((file, line)) => failure.at(file, Some(line)),
        None => failure.at(name.split("::").next().unwrap_or(name), None),
    }
}

pub fn parse_output(stdout: &str, stderr: &str, _exit_code: Option<i32>) -> TestExecutionResult {
    let text = format!("{stdout}\n{stderr}");
    let lines: Vec<&str> = text.lines().collect();
    let mut result = TestExecutionResult::new(TestFramework::Pytest);

    let mut saw_summary = false;
    for line in lines.iter().rev() {
        let core = line.trim().trim_matches('=').trim();
        if SUMMARY_LINE.is_match(core) {
            for caps in SUMMARY_COUNT.captures_iter(core) {
                let n: u32 = caps[1].parse().unwrap_or(0);
                match &caps[2] {
                    "failed" | "error" | "errors" => result.failed += n,
                    "passed" => result.passed += n,
                    "skipped" => result.skipped += n,
                    _ => {}
                }
            }
            saw_summary = true;
            break;
        }
    }
    if !saw_summary {
        result.passed = lines.iter().filter(|l| VERBOSE_PASSED.is_match(l)).count() as u32;
    }

    let blocks = collect_blocks(&lines);
    let mut used = vec![false; blocks.len()];
    for line in &lines {
        let Some(caps) = SHORT_SUMMARY.captures(line.trim()) else {
            continue;
        };
        let is_error = &caps[1] == "ERROR";
        let nodeid = &caps[2];
        let block_idx = blocks.iter().position(|b| b.matches_nodeid(nodeid));
        if let Some(idx) = block_idx {
            used[idx] = true;
        }
        let summary = caps.get(3).map(|m| m.as_str());
        result
            .failures
            .push(build_failure(nodeid, is_error, summary, block_idx.map(|i| &blocks[i])));
    }

    // Reports without a short summary section still carry their blocks.
    for (block, used) in blocks.iter().zip(used) {
        if used || !result.failures.is_empty() {
            continue;
        }
        let is_error = block.header.starts_with("ERROR");
        let name = block
            .header
            .strip_prefix("ERROR collecting ")
            .unwrap_or(&block.header);
        result.failures.push(build_failure(name, is_error, None, Some(block)));
    }

    result
}

/// Names importable directly from the standard library and common aliases.
const SYMBOL_TABLE: &[(&str, &str)] = &[
    ("sqrt", "from math import sqrt"),
    ("pi", "from math import pi"),
    ("floor", "from math import floor"),
    ("ceil", "from math import ceil"),
    ("sin", "from math import sin"),
    ("cos", "from math import cos"),
    ("log", "from math import log"),
    ("exp", "from math import exp"),
    ("inf", "from math import inf"),
    ("datetime", "from datetime import datetime"),
    ("date", "from datetime import date"),
    ("timedelta", "from datetime import timedelta"),
    ("timezone", "from datetime import timezone"),
    ("defaultdict", "from collections import defaultdict"),
    ("Counter", "from collections import Counter"),
    ("OrderedDict", "from collections import OrderedDict"),
    ("namedtuple", "from collections import namedtuple"),
    ("deque", "from collections import deque"),
    ("Path", "from pathlib import Path"),
    ("dataclass", "from dataclasses import dataclass"),
    ("field", "from dataclasses import field"),
    ("Any", "from typing import Any"),
    ("Dict", "from typing import Dict"),
    ("List", "from typing import List"),
    ("Optional", "from typing import Optional"),
    ("Tuple", "from typing import Tuple"),
    ("Union", "from typing import Union"),
    ("Callable", "from typing import Callable"),
    ("Iterable", "from typing import Iterable"),
    ("partial", "from functools import partial"),
    ("reduce", "from functools import reduce"),
    ("lru_cache", "from functools import lru_cache"),
    ("wraps", "from functools import wraps"),
    ("chain", "from itertools import chain"),
    ("groupby", "from itertools import groupby"),
    ("randint", "from random import randint"),
    ("choice", "from random import choice"),
    ("Enum", "from enum import Enum"),
    ("ABC", "from abc import ABC"),
    ("abstractmethod", "from abc import abstractmethod"),
    ("sleep", "from time import sleep"),
    ("uuid4", "from uuid import uuid4"),
    ("deepcopy", "from copy import deepcopy"),
];

const STDLIB_MODULES: &[&str] = &[
    "os", "sys", "re", "json", "math", "time", "random", "logging", "subprocess", "itertools",
    "functools", "collections", "datetime", "pathlib", "typing", "copy", "uuid", "hashlib",
    "shutil", "tempfile", "string", "decimal", "statistics", "csv", "io", "asyncio", "enum",
];

const ALIASES: &[(&str, &str, &str)] = &[
    ("np", "import numpy as np", "numpy"),
    ("pd", "import pandas as pd", "pandas"),
    ("plt", "import matplotlib.pyplot as plt", "matplotlib"),
    ("pytest", "import pytest", "pytest"),
];

/// Import names whose distribution is named differently.
const DISTRIBUTIONS: &[(&str, &str)] = &[
    ("yaml", "pyyaml"),
    ("cv2", "opencv-python"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("bs4", "beautifulsoup4"),
    ("dotenv", "python-dotenv"),
];

static NAME_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"name '(\w+)' is not defined").expect("NAME_ERROR regex should compile")
});

static MODULE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"No module named '([\w.]+)'").expect("MODULE_NOT_FOUND regex should compile")
});

fn snake_case(name: &str) -> String {
    let mut out = String::new();
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn suggest_imports(error_message: &str, context: &ImportContext) -> Vec<ImportSuggestion> {
    let mut out = Vec::new();

    for caps in NAME_ERROR.captures_iter(error_message) {
        let name = &caps[1];
        if let Some((_, stmt)) = SYMBOL_TABLE.iter().find(|(sym, _)| *sym == name) {
            out.push(ImportSuggestion::import(name, *stmt, 0.9, "standard library symbol"));
        }
        if STDLIB_MODULES.contains(&name) {
            out.push(ImportSuggestion::import(name, format!("import {name}"), 0.85, "standard library module"));
        }
        if let Some((_, stmt, dist)) = ALIASES.iter().find(|(alias, _, _)| *alias == name) {
            let confidence = if context.has_dependency(dist) { 0.8 } else { 0.6 };
            out.push(ImportSuggestion::import(name, *stmt, confidence, "conventional alias"));
        }
        let module = snake_case(name);
        if context.local_modules.iter().any(|m| m == &module) {
            out.push(ImportSuggestion::import(
                name,
                format!("from {module} import {name}"),
                0.5,
                "local module with matching name",
            ));
        }
    }

    for caps in MODULE_NOT_FOUND.captures_iter(error_message) {
        let module = &caps[1];
        let top = module.split('.').next().unwrap_or(module);
        if context.local_modules.iter().any(|m| m == top) {
            continue;
        }
        let dist = DISTRIBUTIONS
            .iter()
            .find(|(import, _)| *import == top)
            .map(|(_, dist)| *dist)
            .unwrap_or(top);
        let confidence = if context.has_dependency(dist) { 0.3 } else { 0.6 };
        out.push(ImportSuggestion::install(
            top,
            format!("pip install {dist}"),
            confidence,
            "module not installed",
        ));
    }

    out
}

/// After shebang, encoding and comment lines, the module docstring and any
/// `from __future__` imports.
pub fn import_insertion_line(source: &str) -> usize {
    let lines: Vec<&str> = source.lines().collect();
    let mut idx = 0;
    while idx < lines.len() && lines[idx].trim_start().starts_with('#') {
        idx += 1;
    }
    if let Some(first) = lines.get(idx) {
        let trimmed = first.trim_start();
        let quote = ["\"\"\"", "'''"].into_iter().find(|q| trimmed.starts_with(q));
        if let Some(q) = quote {
            let rest = &trimmed[3..];
            if rest.contains(q) {
                idx += 1;
            } else {
                idx += 1;
                while idx < lines.len() && !lines[idx].contains(q) {
                    idx += 1;
                }
                idx = (idx + 1).min(lines.len());
            }
        }
    }
    while idx < lines.len() && lines[idx].trim_start().starts_with("from __future__") {
        idx += 1;
    }
    idx + 1
}

static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)(?:\[[^\]]*\])?\s*(.*)$").expect("REQUIREMENT regex should compile")
});

static INSTALL_REQUIRES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)install_requires\s*=\s*\[(.*?)\]").expect("INSTALL_REQUIRES regex should compile")
});

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["']([^"']+)["']"#).expect("QUOTED regex should compile")
});

fn parse_requirement(spec: &str, dev: bool) -> Option<Dependency> {
    let spec = spec.split(';').next()?.split('#').next()?.trim();
    if spec.is_empty() || spec.starts_with('-') {
        return None;
    }
    let caps = REQUIREMENT.captures(spec)?;
    Some(Dependency::new(&caps[1], Some(caps[2].trim().to_string()), dev))
}

pub fn read_manifest(repo: &Path) -> Result<DependencyManifest> {
    let mut manifest = DependencyManifest::empty(LanguageRuntime::Python);
    manifest.package_manager = Some(
        if repo.join("poetry.lock").is_file() {
            "poetry"
        } else if repo.join("uv.lock").is_file() {
            "uv"
        } else if repo.join("Pipfile").is_file() {
            "pipenv"
        } else {
            "pip"
        }
        .to_string(),
    );

    if let Some(text) = read_optional(repo, "pyproject.toml")? {
        let doc: toml::Value = toml::from_str(&text).map_err(|e| PatcherError::Manifest {
            path: "pyproject.toml".into(),
            reason: e.to_string(),
        })?;
        manifest.manifest_path = Some("pyproject.toml".into());
        if let Some(project) = doc.get("project") {
            manifest.project_name = project.get("name").and_then(|v| v.as_str()).map(str::to_string);
            manifest.language_version = project
                .get("requires-python")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            for spec in project
                .get("dependencies")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str())
            {
                manifest.dependencies.extend(parse_requirement(spec, false));
            }
            if let Some(optional) = project.get("optional-dependencies").and_then(|v| v.as_table()) {
                for spec in optional
                    .values()
                    .filter_map(|v| v.as_array())
                    .flatten()
                    .filter_map(|v| v.as_str())
                {
                    manifest.dependencies.extend(parse_requirement(spec, true));
                }
            }
        }
        if let Some(poetry) = doc.get("tool").and_then(|t| t.get("poetry")) {
            if manifest.project_name.is_none() {
                manifest.project_name = poetry.get("name").and_then(|v| v.as_str()).map(str::to_string);
            }
            let groups = [
                (poetry.get("dependencies"), false),
                (poetry.get("dev-dependencies"), true),
                (
                    poetry
                        .get("group")
                        .and_then(|g| g.get("dev"))
                        .and_then(|d| d.get("dependencies")),
                    true,
                ),
            ];
            for (table, dev) in groups {
                for (name, value) in table.and_then(|t| t.as_table()).into_iter().flatten() {
                    let version = value
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| value.get("version").and_then(|v| v.as_str()).map(str::to_string));
                    if name == "python" {
                        manifest.language_version = version;
                    } else {
                        manifest.dependencies.push(Dependency::new(name, version, dev));
                    }
                }
            }
        }
    }

    for (file, dev) in [("requirements.txt", false), ("requirements-dev.txt", true)] {
        if let Some(text) = read_optional(repo, file)? {
            manifest.manifest_path.get_or_insert_with(|| file.to_string());
            manifest
                .dependencies
                .extend(text.lines().filter_map(|l| parse_requirement(l, dev)));
        }
    }

    if let Some(text) = read_optional(repo, "setup.py")? {
        manifest.manifest_path.get_or_insert_with(|| "setup.py".to_string());
        if let Some(caps) = INSTALL_REQUIRES.captures(&text) {
            for q in QUOTED.captures_iter(&caps[1]) {
                manifest.dependencies.extend(parse_requirement(&q[1], false));
            }
        }
    }

    Ok(manifest)
}
