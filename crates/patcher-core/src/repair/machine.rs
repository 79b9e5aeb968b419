//! The repair loop state machine.
//!
//! One machine drives one [`Session`] from INGEST to a terminal state:
//!
//! ```text
//! INGEST -> PLAN -> PATCH -> TEST -> PR -> DONE
//!            ^        |        |
//!            |        v        v
//!            +----- REPAIR <---+
//! ```
//!
//! Every phase returns a [`PhaseOutcome`]; retryable outcomes re-run the
//! same phase up to `repair.phase_retry_limit` times before the error
//! routes the session to its terminal state. Budgets are checked at every
//! transition boundary and a snapshot is written after every transition.

use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

use super::change_set::ChangeSet;
use super::planner::{Planner, Proposal};
use super::SessionReport;
use crate::config::PatcherConfig;
use crate::context::{FailureAnalysis, PatchOutcome, SessionContext};
use crate::domain::{
    FixPlan, OutcomeReason, PatchSet, PatcherError, PhaseOutcome, Result, Session, SessionState,
    TerminalOutcome, TerminalStatus, TestExecutionResult,
};
use crate::metrics::METRICS;
use crate::obs::{self, SessionSpan};
use crate::resilience::Message;
use crate::runtime::{ImportSuggestion, ResolvedRuntime, TestExecutor};
use crate::safety::{ApprovedPatchSet, SafetyEngine};
use crate::snapshot::{SessionSnapshot, SnapshotStore};
use crate::workspace::{AppliedPatch, FsWorkspace, Workspace};

/// Upper bound on import hints kept in the session context.
const MAX_CONTEXT_SUGGESTIONS: usize = 10;

/// What a phase asks the machine to do next.
#[derive(Debug)]
enum Step {
    Next(SessionState),
    Finish(TerminalOutcome),
}

/// Drives one repair session.
pub struct RepairStateMachine {
    config: PatcherConfig,
    session: Session,
    context: SessionContext,
    safety: SafetyEngine,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn TestExecutor>,
    workspace: Option<Arc<dyn Workspace>>,
    store: Option<Arc<SnapshotStore>>,
    /// Applied, uncommitted patch sets, oldest first.
    applied: Vec<AppliedPatch>,
    /// Patch set cleared by the safety engine in PLAN, applied in PATCH.
    approved: Option<ApprovedPatchSet>,
    change_set: Option<ChangeSet>,
    started: Instant,
    elapsed_base_ms: u64,
    resumed: bool,
    span: SessionSpan,
}

impl RepairStateMachine {
    /// Start a new session for `repo`.
    pub fn new(
        repo: impl AsRef<Path>,
        config: PatcherConfig,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn TestExecutor>,
    ) -> Result<Self> {
        let session = Session::new(repo.as_ref(), config.budgets);
        let context = SessionContext::new(config.repair.max_conversation_messages);
        Self::assemble(session, context, Vec::new(), config, planner, executor, false)
    }

    /// Continue a session from a snapshot.
    ///
    /// Patches still pending a TEST verdict are rolled back when the
    /// machine starts, and a session caught in PATCH or TEST re-enters PLAN.
    /// A terminal snapshot yields its recorded outcome without doing work.
    pub fn resume(
        snapshot: SessionSnapshot,
        config: PatcherConfig,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn TestExecutor>,
    ) -> Result<Self> {
        let SessionSnapshot {
            session,
            context,
            applied,
            ..
        } = snapshot;
        Self::assemble(session, context, applied, config, planner, executor, true)
    }

    fn assemble(
        session: Session,
        context: SessionContext,
        applied: Vec<AppliedPatch>,
        config: PatcherConfig,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn TestExecutor>,
        resumed: bool,
    ) -> Result<Self> {
        let safety = SafetyEngine::new(config.safety.clone())?;
        let span = SessionSpan::new(session.id(), session.repo_path());
        Ok(Self {
            elapsed_base_ms: session.elapsed_ms(),
            config,
            session,
            context,
            safety,
            planner,
            executor,
            workspace: None,
            store: None,
            applied,
            approved: None,
            change_set: None,
            started: Instant::now(),
            resumed,
            span,
        })
    }

    /// Use `workspace` instead of the repository directory on disk.
    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Persist a snapshot after every transition.
    pub fn with_snapshot_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn safety(&self) -> &SafetyEngine {
        &self.safety
    }

    pub fn change_set(&self) -> Option<&ChangeSet> {
        self.change_set.as_ref()
    }

    pub fn applied(&self) -> &[AppliedPatch] {
        &self.applied
    }

    pub fn snapshot_path(&self) -> Option<std::path::PathBuf> {
        self.store.as_ref().map(|s| s.path_for(self.session.id()))
    }

    /// Summary for callers once the session is terminal.
    pub fn report(&self) -> Option<SessionReport> {
        let outcome = self.session.outcome()?.clone();
        Some(SessionReport {
            session_id: self.session.id(),
            repo: self.session.repo_path().to_path_buf(),
            status: outcome.status,
            outcome,
            iterations: self.session.iteration_count(),
            cost_usd: self.session.accumulated_cost_usd(),
            elapsed_ms: self.session.elapsed_ms(),
            cost_by_phase: self.context.cost_by_phase().clone(),
            change_set: self.change_set.clone(),
            snapshot: self.snapshot_path(),
            resilience: None,
        })
    }

    /// Drive the session to a terminal state.
    pub async fn run(&mut self) -> TerminalOutcome {
        let span = self.span.clone();
        span.instrument(self.drive()).await
    }

    async fn drive(&mut self) -> TerminalOutcome {
        if let Some(outcome) = self.session.outcome() {
            return outcome.clone();
        }
        self.started = Instant::now();
        METRICS.inc_sessions_started();
        obs::emit_session_started(self.session.id(), self.session.repo_path(), self.resumed);

        if self.resumed {
            if let Err(err) = self.recover() {
                return self.conclude(TerminalOutcome::from_error(&err));
            }
        }
        self.persist();

        loop {
            self.tick();
            let state = self.session.state();
            let step = match self.run_phase(state).await {
                Ok(step) => step,
                Err(err) => {
                    tracing::warn!(state = %state, error = %err, "phase failed");
                    Step::Finish(TerminalOutcome::from_error(&err))
                }
            };
            match step {
                Step::Next(next) => {
                    if let Some(outcome) = self.advance(next) {
                        return outcome;
                    }
                }
                Step::Finish(outcome) => return self.conclude(outcome),
            }
        }
    }

    async fn run_phase(&mut self, state: SessionState) -> Result<Step> {
        let mut retries = 0;
        loop {
            let result = match state {
                SessionState::Ingest => self.ingest().await,
                SessionState::Plan => self.plan().await,
                SessionState::Patch => self.patch(),
                SessionState::Test => self.test().await,
                SessionState::Repair => self.repair(),
                SessionState::Pr => self.pr(),
                SessionState::Done | SessionState::Failed | SessionState::Escalated => {
                    return Err(PatcherError::unrecoverable(format!("no phase for terminal state {state}")));
                }
            };
            match PhaseOutcome::from(result) {
                PhaseOutcome::Success(step) => return Ok(step),
                PhaseOutcome::Retryable(err) if retries < self.config.repair.phase_retry_limit => {
                    retries += 1;
                    tracing::warn!(state = %state, attempt = retries, error = %err, "retrying phase");
                    self.tick();
                    self.session.check_budgets()?;
                }
                PhaseOutcome::Retryable(err) | PhaseOutcome::Fatal(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    async fn ingest(&mut self) -> Result<Step> {
        let workspace = self.workspace()?;
        let root = workspace.root().to_path_buf();
        let runtime = match &self.context.code.runtime {
            Some(runtime) => runtime.clone(),
            None => ResolvedRuntime::resolve(&root, self.config.runtime.command_override())?,
        };
        let manifest = match runtime.runtime.read_dependency_manifest(&root) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!(error = %err, "dependency manifest unreadable, continuing without it");
                None
            }
        };
        let file_tree = workspace.file_tree(self.config.repair.file_tree_limit)?;
        let result = self.run_tests(&runtime, &root).await?;

        self.context.code.runtime = Some(runtime);
        self.context.code.manifest = manifest;
        self.context.code.file_tree = file_tree;
        tracing::info!(passed = result.passed, failed = result.failed, "baseline test run");

        let green = result.is_green();
        self.context.set_baseline(result);
        if green {
            return Ok(Step::Finish(TerminalOutcome::done(OutcomeReason::NothingToRepair)));
        }
        self.refresh_failure_context(&root);
        Ok(Step::Next(SessionState::Plan))
    }

    /// Produce a plan and its patch set, then gate the patch set.
    async fn plan(&mut self) -> Result<Step> {
        let iteration = self.session.iteration_count();
        let proposal = self.planner.plan(&self.context, iteration).await?;
        let draft = self.absorb(proposal);
        if draft.steps.is_empty() {
            return Ok(Step::Finish(self.no_fix_found()));
        }
        let supersedes = self.context.latest_plan().map(|p| p.id);
        let plan = FixPlan::from_draft(draft, iteration, supersedes);

        let proposal = self.planner.patch(&plan, &self.context).await?;
        let patches = self.absorb(proposal);
        let patch_set = PatchSet::new(Some(plan.id), iteration, patches);
        tracing::info!(plan = %plan.id, steps = plan.steps.len(), confidence = plan.confidence, "plan produced");
        self.context.record_plan(plan);
        if patch_set.is_empty() {
            return Ok(Step::Finish(self.no_fix_found()));
        }

        let assessment = self.safety.assess(&patch_set);
        obs::emit_risk_assessed(self.session.id(), &assessment);
        let approval = self.safety.approve(&assessment, patch_set.clone());
        self.context
            .record_patch(patch_set, assessment, PatchOutcome::NotApplied);
        match approval {
            Ok(approved) => {
                self.approved = Some(approved);
                Ok(Step::Next(SessionState::Patch))
            }
            Err(err) => Ok(Step::Finish(TerminalOutcome::from_error(&err))),
        }
    }

    fn patch(&mut self) -> Result<Step> {
        let approved = self
            .approved
            .take()
            .ok_or_else(|| PatcherError::unrecoverable("no approved patch set to apply"))?;
        let id = approved.patch_set().id;
        let workspace = self.workspace()?;
        match workspace.apply(&approved) {
            Ok(applied) => {
                METRICS.inc_patches_applied();
                obs::emit_patch_applied(self.session.id(), id, applied.files.len());
                self.context.set_patch_outcome(id, PatchOutcome::Pending);
                self.applied.push(applied);
                self.persist();
                Ok(Step::Next(SessionState::Test))
            }
            Err(PatcherError::PatchApplication { path, reason }) => {
                tracing::warn!(patch_set = %id, %path, %reason, "patch set does not apply");
                let reference = self.context.reference_failures();
                self.context.record_analysis(FailureAnalysis::compare(
                    self.session.iteration_count(),
                    &reference,
                    &reference,
                ));
                self.context.push_message(Message::user(format!(
                    "The previous patch could not be applied to {path}: {reason}"
                )));
                Ok(Step::Next(SessionState::Repair))
            }
            Err(err) => Err(err),
        }
    }

    async fn test(&mut self) -> Result<Step> {
        let runtime = self
            .context
            .code
            .runtime
            .clone()
            .ok_or_else(|| PatcherError::unrecoverable("language runtime was not resolved"))?;
        let workspace = self.workspace()?;
        let root = workspace.root().to_path_buf();
        let result = self.run_tests(&runtime, &root).await?;

        let reference = self.context.reference_failures();
        // A blocking failure the reference run did not have means the patch
        // broke the build and hid the real results.
        let build_broken = result
            .failures
            .iter()
            .any(|f| f.kind.blocks_execution() && !reference.contains(&f.test_name));
        let analysis = FailureAnalysis::compare(
            self.session.iteration_count(),
            &reference,
            &result.failing_set(),
        )
        .with_build_broken(build_broken);
        tracing::info!(
            fixed = analysis.fixed.len(),
            introduced = analysis.introduced.len(),
            persisting = analysis.persisting.len(),
            build_broken,
            "test run analysed"
        );

        if result.is_green() {
            for applied in &self.applied {
                workspace.commit(applied)?;
                self.context
                    .set_patch_outcome(applied.patch_set_id, PatchOutcome::Committed);
            }
            self.applied.clear();
            self.context.record_analysis(analysis);
            self.context.set_last_result(result);
            return Ok(Step::Next(SessionState::Pr));
        }

        if let Some(latest) = self.applied.last() {
            let id = latest.patch_set_id;
            if analysis.keeps_patch() {
                self.context.set_patch_outcome(id, PatchOutcome::Kept);
            } else {
                workspace.rollback(latest)?;
                self.applied.pop();
                METRICS.add_patches_rolled_back(1);
                obs::emit_patch_rolled_back(self.session.id(), id, "no net progress");
                self.context.set_patch_outcome(id, PatchOutcome::RolledBack);
            }
        }
        self.context.record_analysis(analysis);
        self.context.set_last_result(result);
        self.refresh_failure_context(&root);
        Ok(Step::Next(SessionState::Repair))
    }

    fn repair(&mut self) -> Result<Step> {
        let stalled = self.context.consecutive_no_progress();
        if stalled >= self.config.repair.no_progress_limit {
            tracing::warn!(stalled, "no progress, escalating");
            return Ok(Step::Finish(TerminalOutcome::escalated(OutcomeReason::NoProgress {
                consecutive_iterations: stalled,
                failing_tests: self.context.reference_failures().into_iter().collect(),
            })));
        }
        if self.session.iterations_remaining() == 0 {
            return Ok(Step::Finish(TerminalOutcome::from_error(
                &self.session.iteration_budget_error(),
            )));
        }
        if let Some(analysis) = self.context.analyses().last() {
            let summary = format!(
                "Iteration {} result: fixed {:?}, newly failing {:?}, still failing {:?}.",
                analysis.iteration, analysis.fixed, analysis.introduced, analysis.persisting
            );
            self.context.push_message(Message::user(summary));
        }
        Ok(Step::Next(SessionState::Plan))
    }

    fn pr(&mut self) -> Result<Step> {
        let change_set = ChangeSet::assemble(&self.session, &self.context);
        tracing::info!(
            files = change_set.files.len(),
            changed_lines = change_set.total_changed_lines,
            "change set assembled"
        );
        self.change_set = Some(change_set);
        Ok(Step::Finish(TerminalOutcome::done(OutcomeReason::AllTestsPass)))
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Move to `next`, or conclude when a budget forbids it.
    fn advance(&mut self, next: SessionState) -> Option<TerminalOutcome> {
        self.tick();
        if let Err(err) = self.session.check_budgets() {
            return Some(self.conclude(TerminalOutcome::from_error(&err)));
        }
        if next == SessionState::Plan {
            if let Err(err) = self.session.begin_iteration() {
                return Some(self.conclude(TerminalOutcome::from_error(&err)));
            }
        }
        let from = self.session.state();
        if let Err(err) = self.session.transition(next) {
            return Some(self.conclude(TerminalOutcome::from_error(&err)));
        }
        METRICS.inc_transitions();
        obs::emit_session_transition(self.session.id(), from, next, self.session.iteration_count());
        self.persist();
        None
    }

    /// Enter a terminal state, rolling back anything not verified green.
    fn conclude(&mut self, outcome: TerminalOutcome) -> TerminalOutcome {
        self.tick();
        let mut outcome = outcome;
        if outcome.status == TerminalStatus::Done {
            if let Err(err) = self.session.check_budgets() {
                outcome = TerminalOutcome::from_error(&err);
            }
        }
        let from = self.session.state();
        if outcome.status == TerminalStatus::Done && !from.can_transition_to(SessionState::Done) {
            outcome = TerminalOutcome::from_error(&PatcherError::unrecoverable(format!(
                "cannot finish from {from}"
            )));
        }
        if outcome.status != TerminalStatus::Done {
            outcome.rolled_back_patches = self.rollback_all();
            self.change_set = None;
        }
        if let Err(err) = self.session.terminate(outcome.clone()) {
            tracing::error!(error = %err, "could not record terminal outcome");
        }

        METRICS.inc_transitions();
        METRICS.inc_finished(outcome.status);
        obs::emit_session_transition(
            self.session.id(),
            from,
            outcome.status.state(),
            self.session.iteration_count(),
        );
        obs::emit_session_finished(
            self.session.id(),
            &outcome,
            self.session.iteration_count(),
            self.session.accumulated_cost_usd(),
            self.session.elapsed_ms(),
        );
        self.persist();
        METRICS.flush();
        outcome
    }

    fn rollback_all(&mut self) -> u32 {
        let Some(workspace) = self.workspace.clone() else {
            return 0;
        };
        let mut count = 0;
        while let Some(applied) = self.applied.pop() {
            match workspace.rollback(&applied) {
                Ok(()) => {
                    count += 1;
                    obs::emit_patch_rolled_back(self.session.id(), applied.patch_set_id, "session not green");
                    self.context
                        .set_patch_outcome(applied.patch_set_id, PatchOutcome::RolledBack);
                }
                Err(err) => tracing::error!(
                    patch_set = %applied.patch_set_id,
                    backup = %applied.backup_dir.display(),
                    error = %err,
                    "rollback failed, backup left in place"
                ),
            }
        }
        METRICS.add_patches_rolled_back(u64::from(count));
        count
    }

    /// Undo patches that never got a TEST verdict before the interruption.
    fn recover(&mut self) -> Result<()> {
        let state = self.session.state();
        if !matches!(state, SessionState::Patch | SessionState::Test) {
            return Ok(());
        }
        let pending: Vec<_> = self
            .context
            .patches()
            .iter()
            .filter(|r| r.outcome == PatchOutcome::Pending)
            .map(|r| r.patch_set.id)
            .collect();
        let workspace = self.workspace()?;
        for applied in self.applied.iter().rev() {
            if pending.contains(&applied.patch_set_id) {
                workspace.rollback(applied)?;
                obs::emit_patch_rolled_back(self.session.id(), applied.patch_set_id, "interrupted before test verdict");
            }
        }
        self.applied.retain(|a| !pending.contains(&a.patch_set_id));
        for id in pending {
            self.context.set_patch_outcome(id, PatchOutcome::RolledBack);
        }
        tracing::info!(from = %state, "resuming at PLAN");
        self.session.resume_at(SessionState::Plan);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn workspace(&mut self) -> Result<Arc<dyn Workspace>> {
        if let Some(workspace) = &self.workspace {
            return Ok(workspace.clone());
        }
        let workspace: Arc<dyn Workspace> =
            Arc::new(FsWorkspace::new(self.session.repo_path(), self.session.id())?);
        self.workspace = Some(workspace.clone());
        Ok(workspace)
    }

    async fn run_tests(&self, runtime: &ResolvedRuntime, root: &Path) -> Result<TestExecutionResult> {
        let output = self
            .executor
            .execute(&runtime.command, root, self.config.runtime.test_timeout())
            .await?;
        let mut result = runtime.parse_output(&output.stdout, &output.stderr, output.exit_code);
        if result.duration_ms == 0 {
            result.duration_ms = output.duration_ms;
        }
        Ok(result)
    }

    /// Record spend and conversation of a proposal, returning its value.
    fn absorb<T>(&mut self, proposal: Proposal<T>) -> T {
        let Proposal {
            value,
            cost_usd,
            messages,
        } = proposal;
        self.session.add_cost(cost_usd);
        self.context.add_cost(self.session.state(), cost_usd);
        for message in messages {
            self.context.push_message(message);
        }
        value
    }

    fn no_fix_found(&self) -> TerminalOutcome {
        TerminalOutcome::escalated(OutcomeReason::NoFixFound {
            planner: self.planner.name().to_string(),
        })
    }

    /// Recompute import hints and excerpts from the latest test result.
    fn refresh_failure_context(&mut self, root: &Path) {
        let (Some(runtime), Some(result)) = (&self.context.code.runtime, self.context.last_result()) else {
            return;
        };
        let hints = self.context.code.import_context();
        let mut suggestions: Vec<ImportSuggestion> = Vec::new();
        for failure in &result.failures {
            for s in runtime.suggest_imports(&failure.error_text(), &hints) {
                if !suggestions.iter().any(|have| have.statement == s.statement) {
                    suggestions.push(s);
                }
            }
        }
        suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        suggestions.truncate(MAX_CONTEXT_SUGGESTIONS);
        self.context.set_suggestions(suggestions);
        self.context.refresh_excerpts(root);
    }

    fn tick(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.session
            .record_elapsed(self.elapsed_base_ms.saturating_add(elapsed));
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.session, &self.context, &self.applied) {
                obs::emit_snapshot_error(self.session.id(), &err);
            }
        }
    }
}
