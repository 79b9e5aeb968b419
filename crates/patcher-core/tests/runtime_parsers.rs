//! Parsers checked against captured runner output.

use patcher_core::domain::{FailureKind, TestFramework};
use patcher_core::runtime::{ImportContext, LanguageRuntime};

fn parse(runtime: LanguageRuntime, framework: TestFramework, fixture: &str, exit: i32) -> patcher_core::domain::TestExecutionResult {
    runtime.parse_output(framework, fixture, "", Some(exit))
}

#[test]
fn test_pytest_name_error() {
    let r = parse(
        LanguageRuntime::Python,
        TestFramework::Pytest,
        include_str!("fixtures/pytest_name_error.txt"),
        1,
    );
    assert_eq!((r.passed, r.failed), (3, 1));
    let f = &r.failures[0];
    assert_eq!(f.test_name, "tests/test_calculator.py::test_is_prime");
    assert_eq!(f.error_type.as_deref(), Some("NameError"));
    assert_eq!(f.message, "name 'sqrt' is not defined");
    assert_eq!(f.file.as_deref(), Some("src/calculator.py"));
    assert_eq!(f.line, Some(26));
    assert_eq!(f.kind, FailureKind::Error);

    let suggestions = LanguageRuntime::Python.suggest_imports(&f.error_text(), &ImportContext::default());
    assert_eq!(suggestions[0].statement, "from math import sqrt");
}

#[test]
fn test_pytest_assertions_and_class_tests() {
    let r = parse(
        LanguageRuntime::Python,
        TestFramework::Pytest,
        include_str!("fixtures/pytest_assertion.txt"),
        1,
    );
    assert_eq!((r.passed, r.failed), (4, 2));
    assert_eq!(r.failures[0].test_name, "tests/test_cart.py::TestCart::test_total_price");
    assert_eq!(r.failures[0].kind, FailureKind::Assertion);
    assert_eq!(r.failures[0].message, "assert 5 == 6");
    assert_eq!(r.failures[0].line, Some(21));
    assert_eq!(r.failures[1].error_type.as_deref(), Some("KeyError"));
    assert_eq!(r.failures[1].file.as_deref(), Some("shop/pricing.py"));
}

#[test]
fn test_pytest_collection_error_is_setup() {
    let r = parse(
        LanguageRuntime::Python,
        TestFramework::Pytest,
        include_str!("fixtures/pytest_collection_error.txt"),
        2,
    );
    assert_eq!(r.failed, 1);
    let f = &r.failures[0];
    assert_eq!(f.kind, FailureKind::Setup);
    assert_eq!(f.test_name, "tests/test_loader.py");
    assert_eq!(f.error_type.as_deref(), Some("ModuleNotFoundError"));
    assert!(r.has_blocking_failure());
}

#[test]
fn test_pytest_green_run() {
    let r = parse(
        LanguageRuntime::Python,
        TestFramework::Pytest,
        include_str!("fixtures/pytest_pass.txt"),
        0,
    );
    assert!(r.is_green());
    assert_eq!(r.passed, 4);
}

#[test]
fn test_jest_failures_with_locations() {
    let r = parse(
        LanguageRuntime::JavaScript,
        TestFramework::Jest,
        include_str!("fixtures/jest_failure.txt"),
        1,
    );
    assert_eq!((r.passed, r.failed), (4, 2));
    assert_eq!(r.failures[0].test_name, "src/math.test.js::math › computes hypotenuse");
    assert_eq!(r.failures[0].error_type.as_deref(), Some("ReferenceError"));
    assert_eq!(r.failures[0].file.as_deref(), Some("src/math.js"));
    assert_eq!(r.failures[0].line, Some(4));
    assert_eq!(r.failures[1].kind, FailureKind::Assertion);
    assert_eq!(r.failures[1].line, Some(14));
}

#[test]
fn test_jest_suite_failure_skips_dependency_frames() {
    let r = parse(
        LanguageRuntime::JavaScript,
        TestFramework::Jest,
        include_str!("fixtures/jest_suite_failure.txt"),
        1,
    );
    assert_eq!(r.failed, 1);
    let f = &r.failures[0];
    assert_eq!(f.kind, FailureKind::Setup);
    assert_eq!(f.test_name, "src/config.test.js");
    assert_eq!(f.file.as_deref(), Some("src/config.js"));
    let s = LanguageRuntime::JavaScript.suggest_imports(&f.error_text(), &ImportContext::default());
    assert_eq!(s[0].statement, "npm install lodash");
}

#[test]
fn test_vitest_failure() {
    let r = parse(
        LanguageRuntime::JavaScript,
        TestFramework::Vitest,
        include_str!("fixtures/vitest_failure.txt"),
        1,
    );
    assert_eq!((r.passed, r.failed), (1, 1));
    let f = &r.failures[0];
    assert_eq!(f.test_name, "src/math.test.ts::math > computes hypotenuse");
    assert_eq!(f.message, "sqrt is not defined");
    assert_eq!(f.file.as_deref(), Some("src/math.ts"));
    assert_eq!(f.line, Some(4));
}

#[test]
fn test_mocha_failure_via_npm_test() {
    let r = parse(
        LanguageRuntime::JavaScript,
        TestFramework::Unknown,
        include_str!("fixtures/mocha_failure.txt"),
        2,
    );
    assert_eq!(r.framework, TestFramework::Mocha);
    assert_eq!((r.passed, r.failed), (1, 2));
    assert_eq!(r.failures[0].test_name, "math computes hypotenuse");
    assert_eq!(r.failures[0].file.as_deref(), Some("src/math.js"));
    assert_eq!(r.failures[1].test_name, "strings pads left");
    assert_eq!(r.failures[1].kind, FailureKind::Assertion);
    assert_eq!(r.failures[1].line, Some(6));
}

#[test]
fn test_go_build_failure_missing_import() {
    let r = parse(
        LanguageRuntime::Go,
        TestFramework::GoTest,
        include_str!("fixtures/go_build_failure.txt"),
        1,
    );
    assert_eq!(r.failed, 1);
    let f = &r.failures[0];
    assert_eq!(f.kind, FailureKind::Build);
    assert_eq!(f.file.as_deref(), Some("utils.go"));
    assert_eq!(f.line, Some(6));
    assert_eq!(f.message, "undefined: fmt");

    let s = LanguageRuntime::Go.suggest_imports(&f.error_text(), &ImportContext::default());
    assert_eq!(s[0].statement, "import \"fmt\"");
}

#[test]
fn test_go_subtests_and_panics() {
    let r = parse(
        LanguageRuntime::Go,
        TestFramework::GoTest,
        include_str!("fixtures/go_test_failure.txt"),
        1,
    );
    let names: Vec<&str> = r.failures.iter().map(|f| f.test_name.as_str()).collect();
    assert_eq!(names, vec!["TestFormatMessage", "TestParse/empty", "TestDivide"]);
    assert_eq!(r.passed, 2);
    assert_eq!(r.failures[0].line, Some(10));
    assert_eq!(r.failures[1].message, "unexpected error: EOF");
    let panic = &r.failures[2];
    assert_eq!(panic.kind, FailureKind::Panic);
    assert_eq!(panic.message, "runtime error: integer divide by zero");
    assert_eq!(panic.file.as_deref(), Some("/work/utils/utils.go"));
}

#[test]
fn test_cargo_test_failures_across_binaries() {
    let r = parse(
        LanguageRuntime::Rust,
        TestFramework::CargoTest,
        include_str!("fixtures/cargo_test_failure.txt"),
        101,
    );
    assert_eq!((r.passed, r.failed, r.skipped), (3, 2, 1));
    assert_eq!(r.failures[0].test_name, "tests::divides");
    assert_eq!(r.failures[0].kind, FailureKind::Assertion);
    assert_eq!(r.failures[0].line, Some(21));
    assert_eq!(r.failures[1].kind, FailureKind::Panic);
    assert_eq!(r.failures[1].file.as_deref(), Some("src/lib.rs"));
    assert_eq!(r.failures[1].line, Some(30));
}

#[test]
fn test_cargo_compile_error() {
    let r = parse(
        LanguageRuntime::Rust,
        TestFramework::CargoTest,
        include_str!("fixtures/cargo_build_failure.txt"),
        101,
    );
    assert_eq!(r.failed, 1);
    let f = &r.failures[0];
    assert_eq!(f.kind, FailureKind::Build);
    assert_eq!(f.error_type.as_deref(), Some("E0433"));
    assert_eq!(f.file.as_deref(), Some("src/lib.rs"));
    let s = LanguageRuntime::Rust.suggest_imports(&f.error_text(), &ImportContext::default());
    assert_eq!(s[0].statement, "use std::collections::HashMap;");
}

#[test]
fn test_ansi_and_whitespace_tolerated() {
    let colored = format!(
        "\n\n\x1b[1m{}\x1b[0m\n   \n",
        include_str!("fixtures/pytest_pass.txt")
    );
    let r = parse(LanguageRuntime::Python, TestFramework::Pytest, &colored, 0);
    assert!(r.is_green());
    assert_eq!(r.passed, 4);
}

#[test]
fn test_unparseable_nonzero_exit_is_not_green() {
    for runtime in LanguageRuntime::ALL {
        let r = runtime.parse_output(TestFramework::Unknown, "segmentation fault", "", Some(139));
        assert!(!r.is_green(), "{runtime} treated a crash as green");
    }
}
