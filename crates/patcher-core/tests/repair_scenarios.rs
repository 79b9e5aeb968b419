//! End-to-end repair sessions against temporary repositories.
//!
//! Test runs are simulated by executors that inspect the repository and
//! replay captured pytest output, so neither Python nor a backend is needed.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use patcher_core::domain::{BudgetKind, PlanDraft, PlanStep};
use patcher_core::repair::Proposal;
use patcher_core::runtime::CommandOutput;
use patcher_core::{
    ApprovalStatus, BackendError, BackendPlanner, BackendRequest, BackendResponse, CodePatch,
    FixPlan, ImportFixPlanner, Modification, OutcomeReason, PatchOutcome, PatcherConfig,
    Planner, ReasoningBackend, RepairStateMachine, ResilienceConfig, ResilientClient,
    SessionContext, SessionState, SnapshotStore, TerminalStatus, TestCommand, TestExecutor,
};

const CALCULATOR: &str = r#""""Simple calculator module."""


def add(a, b):
    return a + b


def is_prime(n):
    if n < 2:
        return False
    for i in range(2, int(sqrt(n)) + 1):
        if n % i == 0:
            return False
    return True
"#;

const TESTS: &str = r#"from src.calculator import add, is_prime


def test_add():
    assert add(2, 3) == 5


def test_is_prime():
    assert is_prime(2) == True
"#;

const PASS: &str = include_str!("fixtures/pytest_pass.txt");
const NAME_ERROR: &str = include_str!("fixtures/pytest_name_error.txt");

fn e001_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::create_dir_all(root.join("src")).expect("mkdir src");
    std::fs::create_dir_all(root.join("tests")).expect("mkdir tests");
    std::fs::create_dir_all(root.join(".github/workflows")).expect("mkdir workflows");
    std::fs::write(root.join("src/__init__.py"), "").expect("write");
    std::fs::write(root.join("src/calculator.py"), CALCULATOR).expect("write");
    std::fs::write(root.join("tests/test_calculator.py"), TESTS).expect("write");
    std::fs::write(root.join("requirements.txt"), "pytest>=7.0\n").expect("write");
    std::fs::write(root.join(".github/workflows/ci.yml"), "on: push\n").expect("write");
    dir
}

fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).expect("read")
}

/// Green once `src/calculator.py` imports `sqrt`.
#[derive(Default)]
struct PytestOracle {
    runs: AtomicUsize,
    /// Simulated runner duration.
    delay: Duration,
}

#[async_trait]
impl TestExecutor for PytestOracle {
    async fn execute(
        &self,
        _command: &TestCommand,
        workdir: &Path,
        _timeout: Duration,
    ) -> patcher_core::Result<CommandOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fixed = read(workdir, "src/calculator.py").contains("from math import sqrt");
        let (stdout, exit_code) = if fixed { (PASS, 0) } else { (NAME_ERROR, 1) };
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(exit_code),
            duration_ms: 40,
        })
    }
}

/// Never finishes once the fix is on disk, simulating an interrupted TEST.
struct HangsWhenFixed;

#[async_trait]
impl TestExecutor for HangsWhenFixed {
    async fn execute(
        &self,
        command: &TestCommand,
        workdir: &Path,
        timeout: Duration,
    ) -> patcher_core::Result<CommandOutput> {
        if read(workdir, "src/calculator.py").contains("from math import sqrt") {
            std::future::pending::<()>().await;
        }
        PytestOracle::default().execute(command, workdir, timeout).await
    }
}

/// Proposes the same patches every iteration at a fixed cost.
struct FixedPlanner {
    patches: Vec<CodePatch>,
    cost_per_plan: f64,
    plans: AtomicUsize,
}

impl FixedPlanner {
    fn new(patches: Vec<CodePatch>) -> Self {
        Self {
            patches,
            cost_per_plan: 0.0,
            plans: AtomicUsize::new(0),
        }
    }

    fn costing(mut self, usd: f64) -> Self {
        self.cost_per_plan = usd;
        self
    }
}

#[async_trait]
impl Planner for FixedPlanner {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn plan(&self, _context: &SessionContext, _iteration: u32) -> patcher_core::Result<Proposal<PlanDraft>> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        let steps = self
            .patches
            .iter()
            .map(|p| PlanStep {
                description: "scripted edit".into(),
                file_path: p.file_path.clone(),
                change_type: Default::default(),
                rationale: None,
            })
            .collect();
        let mut proposal = Proposal::free(PlanDraft {
            summary: "scripted".into(),
            steps,
            risk_level: Default::default(),
            confidence: 0.5,
            addresses: Vec::new(),
        });
        proposal.cost_usd = self.cost_per_plan;
        Ok(proposal)
    }

    async fn patch(&self, _plan: &FixPlan, _context: &SessionContext) -> patcher_core::Result<Proposal<Vec<CodePatch>>> {
        Ok(Proposal::free(self.patches.clone()))
    }
}

fn comment_patch() -> CodePatch {
    CodePatch::new("src/calculator.py").with_modification(Modification::insert(2, "# touched"))
}

fn machine(
    repo: &Path,
    config: PatcherConfig,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn TestExecutor>,
) -> RepairStateMachine {
    RepairStateMachine::new(repo, config, planner, executor).expect("machine")
}

#[tokio::test]
async fn missing_import_is_fixed_in_one_cycle() {
    let repo = e001_repo();
    let executor = Arc::new(PytestOracle::default());
    let mut m = machine(
        repo.path(),
        PatcherConfig::default(),
        Arc::new(ImportFixPlanner::default()),
        executor.clone(),
    );

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Done);
    assert_eq!(outcome.reason, OutcomeReason::AllTestsPass);
    let session = m.session();
    assert_eq!(session.state(), SessionState::Done);
    assert_eq!(session.iteration_count(), 1);
    assert_eq!(session.visits(SessionState::Patch), 1);
    assert_eq!(session.visits(SessionState::Test), 1);
    assert_eq!(session.visits(SessionState::Repair), 0);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 2);

    let baseline = m.context().baseline().expect("baseline");
    assert_eq!(baseline.failed, 1);

    let record = &m.context().patches()[0];
    assert_eq!(record.assessment.status, ApprovalStatus::AutoApproved);
    assert_eq!(record.outcome, PatchOutcome::Committed);
    assert_eq!(record.patch_set.total_changed_lines(), 1);

    let fixed = read(repo.path(), "src/calculator.py");
    assert!(fixed.starts_with("\"\"\"Simple calculator module.\"\"\"\nfrom math import sqrt\n"));

    let change_set = m.change_set().expect("change set");
    assert_eq!(change_set.files, vec!["src/calculator.py"]);

    let report = m.report().expect("report");
    assert_eq!(report.status, TerminalStatus::Done);
    assert!(m.applied().is_empty());
}

#[tokio::test]
async fn repository_already_green_has_nothing_to_repair() {
    let repo = e001_repo();
    let source = CALCULATOR.replacen("\n\n\n", "\nfrom math import sqrt\n\n\n", 1);
    std::fs::write(repo.path().join("src/calculator.py"), source).expect("write");

    let mut m = machine(
        repo.path(),
        PatcherConfig::default(),
        Arc::new(ImportFixPlanner::default()),
        Arc::new(PytestOracle::default()),
    );
    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Done);
    assert_eq!(outcome.reason, OutcomeReason::NothingToRepair);
    assert_eq!(m.session().visits(SessionState::Plan), 0);
}

#[tokio::test]
async fn inaccessible_repository_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("does-not-exist");
    let executor = Arc::new(PytestOracle::default());
    let mut m = machine(
        &missing,
        PatcherConfig::default(),
        Arc::new(ImportFixPlanner::default()),
        executor.clone(),
    );

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Failed);
    assert!(matches!(outcome.reason, OutcomeReason::Error { .. }));
    assert_eq!(m.session().state(), SessionState::Failed);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
    assert!(m.change_set().is_none());
}

#[tokio::test]
async fn workflow_patch_is_blocked_without_patching() {
    let repo = e001_repo();
    let planner = FixedPlanner::new(vec![CodePatch::new(".github/workflows/ci.yml")
        .with_modification(Modification::insert(1, "# skip tests"))]);
    let mut m = machine(
        repo.path(),
        PatcherConfig::default(),
        Arc::new(planner),
        Arc::new(PytestOracle::default()),
    );

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Escalated);
    match &outcome.reason {
        OutcomeReason::SafetyGate { status, rules } => {
            assert_eq!(*status, ApprovalStatus::Blocked);
            assert!(!rules.is_empty());
        }
        other => panic!("expected safety gate, got {other:?}"),
    }
    assert_eq!(m.session().visits(SessionState::Patch), 0);
    assert_eq!(read(repo.path(), ".github/workflows/ci.yml"), "on: push\n");
    assert_eq!(m.context().patches()[0].outcome, PatchOutcome::NotApplied);
    assert_eq!(m.safety().audit_trail().len(), 1);
}

#[tokio::test]
async fn identical_failures_escalate_on_second_iteration() {
    let repo = e001_repo();
    let planner = Arc::new(FixedPlanner::new(vec![comment_patch()]));
    let mut m = machine(
        repo.path(),
        PatcherConfig::default(),
        planner.clone(),
        Arc::new(PytestOracle::default()),
    );

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Escalated);
    match &outcome.reason {
        OutcomeReason::NoProgress {
            consecutive_iterations,
            failing_tests,
        } => {
            assert_eq!(*consecutive_iterations, 2);
            assert_eq!(failing_tests, &vec!["tests/test_calculator.py::test_is_prime".to_string()]);
        }
        other => panic!("expected no progress, got {other:?}"),
    }
    assert_eq!(m.session().iteration_count(), 2);
    assert!(m.session().iteration_count() < m.session().budgets().max_iterations);
    assert_eq!(planner.plans.load(Ordering::SeqCst), 2);
    // Every attempt was reverted; the file is byte-identical to the original.
    assert_eq!(read(repo.path(), "src/calculator.py"), CALCULATOR);
    assert!(m
        .context()
        .patches()
        .iter()
        .all(|r| r.outcome == PatchOutcome::RolledBack));
}

#[tokio::test]
async fn iteration_budget_escalates_instead_of_looping() {
    let repo = e001_repo();
    let mut config = PatcherConfig::default();
    config.budgets.max_iterations = 2;
    config.repair.no_progress_limit = 10;
    let planner = Arc::new(FixedPlanner::new(vec![comment_patch()]));
    let mut m = machine(repo.path(), config, planner.clone(), Arc::new(PytestOracle::default()));

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Escalated);
    assert!(matches!(
        outcome.reason,
        OutcomeReason::BudgetExceeded { budget: BudgetKind::Iterations, .. }
    ));
    assert_eq!(m.session().iteration_count(), 2);
    assert_eq!(m.session().visits(SessionState::Plan), 2);
    assert_eq!(planner.plans.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cost_budget_wins_over_a_fix() {
    let repo = e001_repo();
    let fix = CodePatch::new("src/calculator.py")
        .with_modification(Modification::insert(2, "from math import sqrt"));
    // The first plan alone costs more than the 5.0 default budget, so the fix never lands.
    let planner = FixedPlanner::new(vec![fix]).costing(6.0);
    let mut m = machine(
        repo.path(),
        PatcherConfig::default(),
        Arc::new(planner),
        Arc::new(PytestOracle::default()),
    );

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Escalated);
    assert!(matches!(
        outcome.reason,
        OutcomeReason::BudgetExceeded { budget: BudgetKind::Cost, .. }
    ));
    assert_eq!(m.session().visits(SessionState::Patch), 0);
    assert_eq!(read(repo.path(), "src/calculator.py"), CALCULATOR);
    assert!(m.session().accumulated_cost_usd() >= 5.0);
}

#[tokio::test(start_paused = true)]
async fn time_budget_escalates_at_next_transition() {
    let repo = e001_repo();
    let mut config = PatcherConfig::default();
    config.budgets.max_duration_secs = 1;
    let executor = Arc::new(PytestOracle {
        runs: AtomicUsize::new(0),
        delay: Duration::from_secs(2),
    });
    let mut m = machine(repo.path(), config, Arc::new(ImportFixPlanner::default()), executor);

    let outcome = m.run().await;

    assert_eq!(outcome.status, TerminalStatus::Escalated);
    assert!(matches!(
        outcome.reason,
        OutcomeReason::BudgetExceeded { budget: BudgetKind::Time, .. }
    ));
    assert_eq!(m.session().visits(SessionState::Plan), 0);
    assert!(m.session().elapsed_ms() >= 2000);
}

#[tokio::test(start_paused = true)]
async fn interrupted_test_phase_resumes_from_snapshot() {
    let repo = e001_repo();
    let state = tempfile::tempdir().expect("state dir");
    let store = Arc::new(SnapshotStore::new(state.path()).expect("store"));

    let mut first = machine(
        repo.path(),
        PatcherConfig::default(),
        Arc::new(ImportFixPlanner::default()),
        Arc::new(HangsWhenFixed),
    )
    .with_snapshot_store(store.clone());
    let id = first.session().id();
    let interrupted = tokio::time::timeout(Duration::from_secs(30), first.run()).await;
    assert!(interrupted.is_err(), "run should hang in TEST");
    drop(first);

    let snapshot = store.load(id).expect("snapshot");
    assert_eq!(snapshot.session.state(), SessionState::Test);
    assert_eq!(snapshot.applied.len(), 1);
    assert!(read(repo.path(), "src/calculator.py").contains("from math import sqrt"));
    let revision = snapshot.revision;

    let mut resumed = RepairStateMachine::resume(
        snapshot,
        PatcherConfig::default(),
        Arc::new(ImportFixPlanner::default()),
        Arc::new(PytestOracle::default()),
    )
    .expect("resume")
    .with_snapshot_store(store.clone());
    let outcome = resumed.run().await;

    assert_eq!(outcome.status, TerminalStatus::Done);
    assert_eq!(resumed.session().id(), id);
    assert_eq!(resumed.session().iteration_count(), 1);
    let outcomes: Vec<PatchOutcome> = resumed.context().patches().iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![PatchOutcome::RolledBack, PatchOutcome::Committed]);
    assert_eq!(read(repo.path(), "src/calculator.py").matches("from math import sqrt").count(), 1);
    assert!(store.load(id).expect("final snapshot").revision > revision);
}

/// Model double that answers both schemas with the sqrt fix.
struct FakeModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ReasoningBackend for FakeModel {
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = match request.schema.as_ref().map(|s| s.name.as_str()) {
            Some("fix_plan") => json!({
                "summary": "import sqrt from math",
                "steps": [{ "description": "add import", "file_path": "src/calculator.py" }],
                "confidence": 0.95,
                "addresses": ["tests/test_calculator.py::test_is_prime"]
            }),
            Some("code_patches") => json!({
                "patches": [{
                    "file_path": "src/calculator.py",
                    "modifications": [{ "kind": "insert", "line": 2, "content": "from math import sqrt" }]
                }]
            }),
            _ => return Err(BackendError::invalid_request("unexpected schema")),
        };
        Ok(BackendResponse::text(body.to_string()).with_cost(0.02))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[tokio::test]
async fn concurrent_sessions_share_one_client() {
    let client = ResilientClient::new(
        FakeModel {
            calls: AtomicUsize::new(0),
        },
        ResilienceConfig::default(),
    );
    let repos = [e001_repo(), e001_repo()];

    let handles = repos.iter().map(|repo| {
        let planner: Arc<dyn Planner> = Arc::new(BackendPlanner::new(client.clone()));
        let mut m = machine(
            repo.path(),
            PatcherConfig::default(),
            planner,
            Arc::new(PytestOracle::default()),
        );
        tokio::spawn(async move {
            let outcome = m.run().await;
            (outcome, m)
        })
    });

    for joined in futures::future::join_all(handles).await {
        let (outcome, m) = joined.expect("join");
        assert_eq!(outcome.status, TerminalStatus::Done);
        assert_eq!(m.session().iteration_count(), 1);
    }
    for repo in &repos {
        assert!(read(repo.path(), "src/calculator.py").contains("from math import sqrt"));
    }

    let stats = client.stats();
    assert_eq!(stats.cache_hits + stats.cache_misses, 4);
    assert_eq!(stats.backend_calls, stats.cache_misses);
    assert_eq!(client.backend().calls.load(Ordering::SeqCst) as u64, stats.backend_calls);
}
