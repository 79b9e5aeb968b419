//! Error taxonomy for repair sessions.
//!
//! Every error knows whether it is transient (worth retrying locally) and
//! which terminal state it routes a session to when it cannot be absorbed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::risk::ApprovalStatus;
use super::session::{BudgetKind, TerminalStatus};

/// Why a test runner could not produce a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunnerErrorKind {
    /// The code under test failed to compile.
    Compile,
    /// Collection or fixture setup failed before assertions ran.
    Setup,
    /// The runner exceeded its timeout and was killed.
    Timeout,
    /// The runner could not be spawned or exited abnormally.
    Crash,
}

impl std::fmt::Display for TestRunnerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile => write!(f, "compile"),
            Self::Setup => write!(f, "setup"),
            Self::Timeout => write!(f, "timeout"),
            Self::Crash => write!(f, "crash"),
        }
    }
}

/// Serializable discriminant of [`PatcherError`], kept in audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientBackend,
    RateLimited,
    CircuitOpen,
    SchemaValidation,
    InvalidRequest,
    Auth,
    SafetyViolation,
    TestRunner,
    BudgetExceeded,
    PatchApplication,
    Manifest,
    Snapshot,
    Config,
    Unrecoverable,
}

/// Errors produced by repo-patcher components.
#[derive(Debug, thiserror::Error)]
pub enum PatcherError {
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("circuit breaker open: backend calls are failing fast")]
    CircuitOpen,

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("invalid backend request: {0}")]
    InvalidRequest(String),

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("safety violation ({status}): {}", rules.join(", "))]
    SafetyViolation {
        status: ApprovalStatus,
        rules: Vec<String>,
    },

    #[error("test runner error ({kind}): {message}")]
    TestRunner {
        kind: TestRunnerErrorKind,
        message: String,
    },

    #[error("{kind} budget exceeded: used {used}, limit {limit}")]
    BudgetExceeded {
        kind: BudgetKind,
        used: String,
        limit: String,
    },

    #[error("patch application failed for {path}: {reason}")]
    PatchApplication { path: String, reason: String },

    #[error("invalid dependency manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PatcherError {
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn test_runner(kind: TestRunnerErrorKind, message: impl Into<String>) -> Self {
        Self::TestRunner {
            kind,
            message: message.into(),
        }
    }

    /// Audit discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientBackend(_) => ErrorKind::TransientBackend,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen => ErrorKind::CircuitOpen,
            Self::SchemaValidation(_) => ErrorKind::SchemaValidation,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Auth(_) => ErrorKind::Auth,
            Self::SafetyViolation { .. } => ErrorKind::SafetyViolation,
            Self::TestRunner { .. } => ErrorKind::TestRunner,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::PatchApplication { .. } => ErrorKind::PatchApplication,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::Snapshot(_) => ErrorKind::Snapshot,
            Self::Config(_) => ErrorKind::Config,
            Self::Unrecoverable(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Unrecoverable,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientBackend(_) | Self::RateLimited { .. } => true,
            Self::TestRunner { kind, .. } => *kind == TestRunnerErrorKind::Timeout,
            _ => false,
        }
    }

    /// Terminal state a session lands in when this error cannot be absorbed.
    ///
    /// Conditions a human can resolve (budgets, safety gates, an unavailable
    /// backend, a hanging test suite) escalate; everything else fails.
    pub fn terminal_status(&self) -> TerminalStatus {
        match self {
            Self::TransientBackend(_)
            | Self::RateLimited { .. }
            | Self::CircuitOpen
            | Self::SafetyViolation { .. }
            | Self::BudgetExceeded { .. } => TerminalStatus::Escalated,
            Self::TestRunner { kind, .. } if *kind == TestRunnerErrorKind::Timeout => {
                TerminalStatus::Escalated
            }
            _ => TerminalStatus::Failed,
        }
    }
}

/// Result type for repo-patcher operations.
pub type Result<T> = std::result::Result<T, PatcherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PatcherError::TransientBackend("502".into()).is_transient());
        assert!(PatcherError::RateLimited { retry_after: None }.is_transient());
        assert!(!PatcherError::Auth("bad key".into()).is_transient());
        assert!(!PatcherError::InvalidRequest("bad body".into()).is_transient());
        assert!(!PatcherError::CircuitOpen.is_transient());
        assert!(
            PatcherError::test_runner(TestRunnerErrorKind::Timeout, "60s").is_transient()
        );
        assert!(!PatcherError::test_runner(TestRunnerErrorKind::Crash, "spawn").is_transient());
    }

    #[test]
    fn test_terminal_routing() {
        let budget = PatcherError::BudgetExceeded {
            kind: BudgetKind::Cost,
            used: "5.10".into(),
            limit: "5.00".into(),
        };
        assert_eq!(budget.terminal_status(), TerminalStatus::Escalated);

        let safety = PatcherError::SafetyViolation {
            status: ApprovalStatus::Blocked,
            rules: vec!["critical_path".into()],
        };
        assert_eq!(safety.terminal_status(), TerminalStatus::Escalated);

        assert_eq!(
            PatcherError::unrecoverable("repository missing").terminal_status(),
            TerminalStatus::Failed
        );
        assert_eq!(
            PatcherError::SchemaValidation("missing steps".into()).terminal_status(),
            TerminalStatus::Failed
        );
        assert_eq!(
            PatcherError::test_runner(TestRunnerErrorKind::Crash, "no such file").terminal_status(),
            TerminalStatus::Failed
        );
    }

    #[test]
    fn test_io_errors_are_unrecoverable() {
        let err: PatcherError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.kind(), ErrorKind::Unrecoverable);
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_safety_violation_display_lists_rules() {
        let err = PatcherError::SafetyViolation {
            status: ApprovalStatus::Blocked,
            rules: vec!["critical_path".into(), "secret_literal".into()],
        };
        let text = err.to_string();
        assert!(text.contains("blocked"));
        assert!(text.contains("critical_path, secret_literal"));
    }
}
