//! Plan and patch generation.
//!
//! A [`Planner`] turns the session context into a [`PlanDraft`] and then
//! into concrete [`CodePatch`]es. [`BackendPlanner`] asks the reasoning
//! backend for both, constrained by JSON Schemas.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write as _;

use crate::context::SessionContext;
use crate::domain::{CodePatch, FixPlan, PatcherError, PlanDraft, Result};
use crate::resilience::{
    BackendRequest, BackendResponse, CallMode, Message, ReasoningBackend, ResilientClient,
};

/// Planner output plus what it cost and the conversation it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal<T> {
    pub value: T,
    pub cost_usd: f64,
    /// Turns to append to the session conversation.
    pub messages: Vec<Message>,
}

impl<T> Proposal<T> {
    /// A proposal computed locally, at no cost.
    pub fn free(value: T) -> Self {
        Self {
            value,
            cost_usd: 0.0,
            messages: Vec::new(),
        }
    }
}

/// Source of fix plans and patches for the repair loop.
#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// Propose a plan for the failures recorded in `context`. An empty
    /// step list means the planner has nothing to offer.
    async fn plan(&self, context: &SessionContext, iteration: u32) -> Result<Proposal<PlanDraft>>;

    /// Turn `plan` into patches against the current repository contents.
    async fn patch(&self, plan: &FixPlan, context: &SessionContext) -> Result<Proposal<Vec<CodePatch>>>;
}

/// Schema for plan responses.
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary", "steps", "confidence"],
        "properties": {
            "summary": { "type": "string", "minLength": 1 },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["description", "file_path"],
                    "properties": {
                        "description": { "type": "string" },
                        "file_path": { "type": "string", "minLength": 1 },
                        "change_type": { "enum": ["modify", "add", "delete"] },
                        "rationale": { "type": "string" }
                    }
                }
            },
            "risk_level": { "enum": ["minimal", "low", "medium", "high", "critical"] },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "addresses": { "type": "array", "items": { "type": "string" } }
        }
    })
}

/// Schema for patch responses.
pub fn patch_schema() -> Value {
    json!({
        "type": "object",
        "required": ["patches"],
        "properties": {
            "patches": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["file_path", "modifications"],
                    "properties": {
                        "file_path": { "type": "string", "minLength": 1 },
                        "rationale": { "type": "string" },
                        "modifications": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["kind"],
                                "properties": {
                                    "kind": { "enum": ["insert", "replace", "delete", "create"] },
                                    "line": { "type": "integer", "minimum": 1 },
                                    "content": { "type": "string" },
                                    "expected": { "type": "string" }
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

const SYSTEM_PROMPT: &str = "You repair failing test suites. Make the smallest change that fixes \
the listed failures. Never edit CI configuration, secrets or dependency manifests. \
Reply with JSON only.";

#[derive(Debug, Deserialize)]
struct PatchResponse {
    patches: Vec<CodePatch>,
}

/// Render failures, suggestions, excerpts and history as a prompt body.
pub fn describe_context(context: &SessionContext) -> String {
    let mut out = String::new();
    if let Some(runtime) = &context.code.runtime {
        let _ = writeln!(out, "Runtime: {} ({})", runtime.runtime, runtime.framework);
        let _ = writeln!(out, "Test command: {}", runtime.command);
    }
    if let Some(result) = context.last_result() {
        let _ = writeln!(out, "\nFailing tests ({} passed, {} failed):", result.passed, result.failed);
        for failure in &result.failures {
            let location = match (&failure.file, failure.line) {
                (Some(file), Some(line)) => format!(" at {file}:{line}"),
                (Some(file), None) => format!(" at {file}"),
                _ => String::new(),
            };
            let _ = writeln!(out, "- {}{location}: {}", failure.test_name, failure.error_text());
        }
    }
    if !context.suggestions().is_empty() {
        let _ = writeln!(out, "\nImport hints:");
        for s in context.suggestions() {
            let _ = writeln!(out, "- {} ({:.2}): {}", s.statement, s.confidence, s.reason);
        }
    }
    for analysis in context.analyses() {
        let _ = writeln!(
            out,
            "\nIteration {}: fixed {:?}, introduced {:?}, still failing {:?}{}",
            analysis.iteration,
            analysis.fixed,
            analysis.introduced,
            analysis.persisting,
            if analysis.build_broken { " (build broke)" } else { "" }
        );
    }
    for plan in context.plans() {
        let _ = writeln!(out, "Previous plan (iteration {}): {}", plan.iteration, plan.summary);
    }
    for (path, text) in &context.code.excerpts {
        let _ = writeln!(out, "\n--- {path}");
        for (idx, line) in text.lines().enumerate() {
            let _ = writeln!(out, "{:>4} | {line}", idx + 1);
        }
    }
    out
}

/// Planner backed by a [`ResilientClient`].
pub struct BackendPlanner<B> {
    client: ResilientClient<B>,
    mode: CallMode,
    temperature: Option<f32>,
}

impl<B: ReasoningBackend> BackendPlanner<B> {
    pub fn new(client: ResilientClient<B>) -> Self {
        Self {
            client,
            mode: CallMode::Blocking,
            temperature: Some(0.0),
        }
    }

    pub fn with_mode(mut self, mode: CallMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn client(&self) -> &ResilientClient<B> {
        &self.client
    }

    async fn ask(&self, prompt: String, schema_name: &str, schema: Value) -> Result<(Value, BackendResponse, Message)> {
        let user = Message::user(prompt);
        let mut request = BackendRequest::new(vec![Message::system(SYSTEM_PROMPT), user.clone()])
            .with_schema(schema_name, schema);
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }
        let response = self.client.complete(&request, self.mode).await?;
        let data = response.data.clone().ok_or_else(|| {
            PatcherError::SchemaValidation(format!("{schema_name}: response carried no JSON"))
        })?;
        Ok((data, response, user))
    }
}

#[async_trait]
impl<B: ReasoningBackend> Planner for BackendPlanner<B> {
    fn name(&self) -> &str {
        "backend"
    }

    async fn plan(&self, context: &SessionContext, iteration: u32) -> Result<Proposal<PlanDraft>> {
        let prompt = format!(
            "Iteration {iteration}. Propose a fix plan for these failures.\n\n{}",
            describe_context(context)
        );
        let (data, response, user) = self.ask(prompt, "fix_plan", plan_schema()).await?;
        let draft: PlanDraft = serde_json::from_value(data)
            .map_err(|e| PatcherError::SchemaValidation(format!("fix_plan: {e}")))?;
        Ok(Proposal {
            value: draft,
            cost_usd: response.cost_usd,
            messages: vec![user, Message::assistant(response.content)],
        })
    }

    async fn patch(&self, plan: &FixPlan, context: &SessionContext) -> Result<Proposal<Vec<CodePatch>>> {
        let mut prompt = format!("Write patches implementing this plan: {}\n", plan.summary);
        for (idx, step) in plan.steps.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {} ({})", idx + 1, step.description, step.file_path);
        }
        prompt.push_str(
            "\nLine numbers refer to the excerpts below and are 1-based. \
             Set `expected` to the current text of every replaced or deleted line.\n\n",
        );
        prompt.push_str(&describe_context(context));
        let (data, response, user) = self.ask(prompt, "code_patches", patch_schema()).await?;
        let parsed: PatchResponse = serde_json::from_value(data)
            .map_err(|e| PatcherError::SchemaValidation(format!("code_patches: {e}")))?;
        Ok(Proposal {
            value: parsed.patches,
            cost_usd: response.cost_usd,
            messages: vec![user, Message::assistant(response.content)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, ModificationKind, TestExecutionResult, TestFailure, TestFramework};
    use crate::resilience::{BackendError, ResilienceConfig};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Canned {
        replies: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<BackendRequest>>,
    }

    #[async_trait]
    impl ReasoningBackend for Canned {
        async fn send(&self, request: &BackendRequest) -> std::result::Result<BackendResponse, BackendError> {
            self.seen.lock().expect("lock").push(request.clone());
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| BackendError::invalid_request("script exhausted"))?;
            Ok(BackendResponse::text(reply).with_cost(0.01))
        }
    }

    fn planner(replies: &[&str]) -> BackendPlanner<Canned> {
        let backend = Canned {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            seen: Mutex::new(Vec::new()),
        };
        BackendPlanner::new(ResilientClient::new(backend, ResilienceConfig::default()))
    }

    fn context() -> SessionContext {
        let mut ctx = SessionContext::default();
        let mut result = TestExecutionResult::new(TestFramework::Pytest);
        result.failed = 1;
        result.failures.push(
            TestFailure::new("tests/test_calc.py::test_is_prime", FailureKind::Error, "name 'sqrt' is not defined")
                .with_error_type("NameError")
                .at("src/calc.py", Some(3)),
        );
        ctx.set_baseline(result);
        ctx.code
            .excerpts
            .insert("src/calc.py".into(), "def is_prime(n):\n    return sqrt(n)\n".into());
        ctx
    }

    #[tokio::test]
    async fn test_backend_plan_parses_schema_output() {
        let p = planner(&[r#"```json
{"summary":"import sqrt","steps":[{"description":"add import","file_path":"src/calc.py"}],"confidence":0.9,"addresses":["tests/test_calc.py::test_is_prime"]}
```"#]);
        let proposal = p.plan(&context(), 1).await.expect("plan");
        assert_eq!(proposal.value.summary, "import sqrt");
        assert_eq!(proposal.value.steps[0].file_path, "src/calc.py");
        assert!((proposal.cost_usd - 0.01).abs() < 1e-9);
        assert_eq!(proposal.messages.len(), 2);

        let seen = p.client().backend().seen.lock().expect("lock").clone();
        let prompt = &seen[0].messages[1].content;
        assert!(prompt.contains("NameError: name 'sqrt' is not defined"));
        assert!(prompt.contains("   2 |     return sqrt(n)"));
    }

    #[tokio::test]
    async fn test_backend_patch_gets_corrective_retry() {
        let p = planner(&[
            r#"{"patches":[{"file_path":"src/calc.py","modifications":[]}]}"#,
            r#"{"patches":[{"file_path":"src/calc.py","modifications":[{"kind":"insert","line":1,"content":"from math import sqrt"}]}]}"#,
        ]);
        let plan = FixPlan::from_draft(
            PlanDraft {
                summary: "import sqrt".into(),
                steps: Vec::new(),
                risk_level: Default::default(),
                confidence: 0.9,
                addresses: Vec::new(),
            },
            1,
            None,
        );
        let proposal = p.patch(&plan, &context()).await.expect("patch");
        assert_eq!(proposal.value.len(), 1);
        assert_eq!(proposal.value[0].modifications[0].kind, ModificationKind::Insert);
        assert_eq!(p.client().stats().schema_retries, 1);
        assert!((proposal.cost_usd - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_schemas_accept_domain_shapes() {
        let draft = json!({"summary":"s","steps":[],"confidence":0.5});
        assert!(crate::resilience::schema::validate(&plan_schema(), &draft).is_ok());
        let bad = json!({"summary":"s","steps":[],"confidence":2.0});
        assert!(crate::resilience::schema::validate(&plan_schema(), &bad).is_err());
    }
}
