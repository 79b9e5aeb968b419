//! Layered configuration: defaults, optional TOML file, environment, then
//! caller overrides, finally validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::{DEFAULT_MAX_FILES, DEFAULT_MAX_MESSAGES};
use crate::domain::{Budgets, PatcherError, Result};
use crate::resilience::ResilienceConfig;
use crate::runtime::TestCommand;
use crate::safety::{RiskCombination, SafetyPolicy};
use crate::workspace::STATE_DIR_NAME;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub test_timeout_secs: u64,
    /// Replaces the detected framework's command; output is still parsed
    /// with the detected framework's parser.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: 60,
            test_command: None,
        }
    }
}

impl RuntimeConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn command_override(&self) -> Option<TestCommand> {
        self.test_command.as_deref().and_then(TestCommand::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Extra attempts for a phase that returned a retryable error.
    pub phase_retry_limit: u32,
    /// Consecutive iterations without progress before escalating.
    pub no_progress_limit: u32,
    /// Minimum confidence for the offline planner to act on a suggestion.
    pub import_confidence_threshold: f64,
    pub max_conversation_messages: usize,
    pub file_tree_limit: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            phase_retry_limit: 1,
            no_progress_limit: 2,
            import_confidence_threshold: 0.8,
            max_conversation_messages: DEFAULT_MAX_MESSAGES,
            file_tree_limit: DEFAULT_MAX_FILES,
        }
    }
}

/// Top-level configuration for a repair run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    pub budgets: Budgets,
    pub safety: SafetyPolicy,
    pub resilience: ResilienceConfig,
    pub runtime: RuntimeConfig,
    pub repair: RepairConfig,
    /// Where snapshots are written. Defaults to `<repo>/.repo-patcher/sessions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl PatcherConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PatcherError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
            .map_err(|e| PatcherError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `PATCHER_*` overrides read through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| PatcherError::Config(format!("{key}: cannot parse {value:?}")))
        }

        if let Some(v) = lookup("PATCHER_MAX_ITERATIONS") {
            self.budgets.max_iterations = parse("PATCHER_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("PATCHER_MAX_COST") {
            self.budgets.max_cost_usd = parse("PATCHER_MAX_COST", &v)?;
        }
        if let Some(v) = lookup("PATCHER_MAX_DURATION_SECS") {
            self.budgets.max_duration_secs = parse("PATCHER_MAX_DURATION_SECS", &v)?;
        }
        if let Some(v) = lookup("PATCHER_TEST_TIMEOUT_SECS") {
            self.runtime.test_timeout_secs = parse("PATCHER_TEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PATCHER_STATE_DIR") {
            if !v.trim().is_empty() {
                self.state_dir = Some(PathBuf::from(v.trim()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PatcherError::Config(msg));
        let b = &self.budgets;
        if !(1..=10).contains(&b.max_iterations) {
            return invalid(format!("max_iterations must be 1..=10, got {}", b.max_iterations));
        }
        if !(b.max_cost_usd.is_finite() && b.max_cost_usd > 0.0) {
            return invalid(format!("max_cost_usd must be positive, got {}", b.max_cost_usd));
        }
        if b.max_duration_secs == 0 {
            return invalid("max_duration_secs must be positive".into());
        }
        if self.runtime.test_timeout_secs == 0 {
            return invalid("test_timeout_secs must be positive".into());
        }
        if let RiskCombination::Weighted {
            path_weight,
            content_weight,
        } = self.safety.combination
        {
            for (name, w) in [("path_weight", path_weight), ("content_weight", content_weight)] {
                if !(0.0..=1.0).contains(&w) {
                    return invalid(format!("{name} must be within 0..=1, got {w}"));
                }
            }
            if path_weight + content_weight <= 0.0 {
                return invalid("risk weights cannot both be zero".into());
            }
        }
        if !(0.0..=1.0).contains(&self.resilience.retry.jitter) {
            return invalid(format!("retry jitter must be within 0..=1, got {}", self.resilience.retry.jitter));
        }
        if !(0.0..=1.0).contains(&self.repair.import_confidence_threshold) {
            return invalid("import_confidence_threshold must be within 0..=1".into());
        }
        if self.repair.no_progress_limit == 0 {
            return invalid("no_progress_limit must be at least 1".into());
        }
        let rl = &self.resilience.rate_limit;
        for (name, limit) in [
            ("bucket_capacity", rl.bucket_capacity),
            ("refill_per_minute", rl.refill_per_minute),
            ("requests_per_minute", rl.requests_per_minute),
            ("requests_per_hour", rl.requests_per_hour),
        ] {
            if limit == 0 {
                return invalid(format!("{name} must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn state_dir_for(&self, repo: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| repo.join(STATE_DIR_NAME).join("sessions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_values() {
        let c = PatcherConfig::default();
        assert_eq!(c.budgets.max_iterations, 3);
        assert_eq!(c.budgets.max_cost_usd, 5.0);
        assert_eq!(c.budgets.max_duration_secs, 600);
        assert_eq!(c.runtime.test_timeout_secs, 60);
        assert_eq!(c.safety.max_lines_per_file, 100);
        assert_eq!(c.safety.max_total_lines, 500);
        assert_eq!(c.safety.auto_approve_max_lines, 20);
        assert_eq!(c.resilience.rate_limit.requests_per_minute, 60);
        assert_eq!(c.resilience.rate_limit.requests_per_hour, 3600);
        assert_eq!(c.resilience.circuit_breaker.failure_threshold, 5);
        assert_eq!(c.resilience.circuit_breaker.cooldown_secs, 30);
        assert_eq!(c.resilience.retry.max_retries, 3);
        assert_eq!(c.resilience.cache.ttl_secs, 3600);
        assert_eq!(c.resilience.cache.capacity, 1000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = PatcherConfig::from_toml(
            r#"
            [budgets]
            max_iterations = 5

            [resilience.cache]
            ttl_secs = 60

            [runtime]
            test_command = "npm run test:unit"
            "#,
        )
        .expect("parse");
        assert_eq!(c.budgets.max_iterations, 5);
        assert_eq!(c.budgets.max_cost_usd, 5.0);
        assert_eq!(c.resilience.cache.ttl_secs, 60);
        assert_eq!(c.resilience.cache.capacity, 1000);
        let cmd = c.runtime.command_override().expect("command");
        assert_eq!(cmd.program, "npm");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PATCHER_MAX_ITERATIONS", "7"),
            ("PATCHER_MAX_COST", "1.25"),
            ("PATCHER_STATE_DIR", "/var/lib/patcher"),
        ]
        .into_iter()
        .collect();
        let mut c = PatcherConfig::default();
        c.apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .expect("env");
        assert_eq!(c.budgets.max_iterations, 7);
        assert_eq!(c.budgets.max_cost_usd, 1.25);
        assert_eq!(c.state_dir_for(Path::new("/repo")), PathBuf::from("/var/lib/patcher"));

        let mut c = PatcherConfig::default();
        let err = c
            .apply_env_with(|k| (k == "PATCHER_MAX_COST").then(|| "lots".to_string()))
            .expect_err("bad number");
        assert!(matches!(err, PatcherError::Config(_)));
    }

    #[test]
    fn test_validation_bounds() {
        let mut c = PatcherConfig::default();
        c.budgets.max_iterations = 11;
        assert!(c.validate().is_err());

        let mut c = PatcherConfig::default();
        c.budgets.max_cost_usd = 0.0;
        assert!(c.validate().is_err());

        let mut c = PatcherConfig::default();
        c.safety.combination = RiskCombination::Weighted {
            path_weight: 1.5,
            content_weight: 0.5,
        };
        assert!(c.validate().is_err());

        let mut c = PatcherConfig::default();
        c.resilience.rate_limit.requests_per_minute = 0;
        let err = c.validate().expect_err("zero window");
        assert!(matches!(err, PatcherError::Config(ref m) if m.contains("requests_per_minute")));

        let mut c = PatcherConfig::default();
        c.resilience.rate_limit.requests_per_hour = 0;
        assert!(c.validate().is_err());

        let c = PatcherConfig::default();
        assert_eq!(
            c.state_dir_for(Path::new("/repo")),
            PathBuf::from("/repo/.repo-patcher/sessions")
        );
    }
}
