//! Test command execution as a subprocess with a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::domain::{PatcherError, Result, TestRunnerErrorKind};

/// Program, arguments and extra environment for a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl TestCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Split a whitespace-separated command line. Returns `None` when empty.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            env: BTreeMap::new(),
        })
    }
}

impl std::fmt::Display for TestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished test process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Runs test commands on behalf of the repair loop.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, command: &TestCommand, workdir: &Path, timeout: Duration) -> Result<CommandOutput>;
}

/// Executes commands with `tokio::process`, killing the child on timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessExecutor;

#[async_trait]
impl TestExecutor for SubprocessExecutor {
    async fn execute(&self, command: &TestCommand, workdir: &Path, timeout: Duration) -> Result<CommandOutput> {
        let start = Instant::now();
        tracing::debug!(command = %command, workdir = %workdir.display(), "spawning test runner");

        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(workdir)
            .env("CI", "1")
            .env("NO_COLOR", "1")
            .env("FORCE_COLOR", "0")
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PatcherError::test_runner(
                    TestRunnerErrorKind::Crash,
                    format!("failed to spawn `{}`: {e}", command.program),
                )
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PatcherError::test_runner(
                    TestRunnerErrorKind::Timeout,
                    format!("`{command}` timed out after {}s", timeout.as_secs()),
                )
            })?
            .map_err(|e| {
                PatcherError::test_runner(TestRunnerErrorKind::Crash, format!("`{command}` failed: {e}"))
            })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            command = %command,
            exit_code = ?output.status.code(),
            duration_ms,
            "test runner finished"
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cmd = TestCommand::parse("  python -m pytest -q ").expect("non-empty");
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["-m", "pytest", "-q"]);
        assert_eq!(cmd.to_string(), "python -m pytest -q");
        assert!(TestCommand::parse("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executor_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = TestCommand::new("sh", &["-c", "echo out; echo err >&2; exit 3"]);
        let out = SubprocessExecutor
            .execute(&cmd, dir.path(), Duration::from_secs(10))
            .await
            .expect("run");
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executor_sets_ci_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = TestCommand::new("sh", &["-c", "echo $CI-$NO_COLOR-$EXTRA"]).with_env("EXTRA", "x");
        let out = SubprocessExecutor
            .execute(&cmd, dir.path(), Duration::from_secs(10))
            .await
            .expect("run");
        assert_eq!(out.stdout.trim(), "1-1-x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_executor_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = TestCommand::new("sleep", &["5"]);
        let err = SubprocessExecutor
            .execute(&cmd, dir.path(), Duration::from_millis(100))
            .await
            .expect_err("timeout");
        assert!(matches!(
            err,
            PatcherError::TestRunner {
                kind: TestRunnerErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_executor_missing_program_is_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = TestCommand::new("definitely-not-a-test-runner-xyz", &[]);
        let err = SubprocessExecutor
            .execute(&cmd, dir.path(), Duration::from_secs(1))
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            PatcherError::TestRunner {
                kind: TestRunnerErrorKind::Crash,
                ..
            }
        ));
    }
}
