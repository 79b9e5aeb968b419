//! repo-patcher CLI
//!
//! ## Commands
//!
//! - `fix`: run a repair session against a repository
//! - `resume`: continue a session from its snapshot
//! - `assess`: print the risk assessment of a patch set
//! - `detect`: print the detected language runtime and manifest
//!
//! Exit codes: 0 done, 1 failed or error, 2 escalated.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

use patcher_backend::ChatBackend;
use patcher_core::runtime::score_languages;
use patcher_core::{
    load_snapshot, BackendPlanner, ImportFixPlanner, PatchSet, PatcherConfig, Planner,
    RepairStateMachine, ResilienceStats, ResilientClient, ResolvedRuntime, SafetyEngine,
    SnapshotStore, SubprocessExecutor, TerminalStatus,
};

#[derive(Parser, Debug)]
#[command(name = "repo-patcher")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Budgeted, guard-railed repair loop for repositories with failing tests", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by `fix` and `resume`.
#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the offline import-fix planner instead of the reasoning backend
    #[arg(long)]
    offline: bool,

    /// Replace the detected test command (output is still parsed for the detected framework)
    #[arg(long)]
    test_command: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Repair the failing tests of a repository
    Fix {
        /// Repository root
        #[arg(default_value = ".")]
        repo: PathBuf,

        /// Maximum PLAN iterations
        #[arg(long, env = "PATCHER_MAX_ITERATIONS")]
        max_iterations: Option<u32>,

        /// Maximum backend spend in USD
        #[arg(long, env = "PATCHER_MAX_COST")]
        max_cost: Option<f64>,

        /// Maximum wall-clock time in seconds
        #[arg(long, env = "PATCHER_MAX_DURATION_SECS")]
        max_duration: Option<u64>,

        /// Snapshot directory (default: <repo>/.repo-patcher/sessions)
        #[arg(long, env = "PATCHER_STATE_DIR")]
        state_dir: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Continue an interrupted session
    Resume {
        /// Snapshot file written by an earlier run
        snapshot: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the risk assessment of a patch set (JSON)
    Assess {
        /// Patch set file
        patch_set: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the language runtime and dependency manifest of a repository
    Detect {
        /// Repository root
        #[arg(default_value = ".")]
        repo: PathBuf,
    },
}

fn exit_code(status: TerminalStatus) -> u8 {
    match status {
        TerminalStatus::Done => 0,
        TerminalStatus::Failed => 1,
        TerminalStatus::Escalated => 2,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    patcher_core::telemetry::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Fix {
            repo,
            max_iterations,
            max_cost,
            max_duration,
            state_dir,
            run,
        } => {
            cmd_fix(
                &repo,
                Overrides {
                    max_iterations,
                    max_cost,
                    max_duration,
                    state_dir,
                },
                &run,
            )
            .await
        }
        Commands::Resume { snapshot, run } => cmd_resume(&snapshot, &run).await,
        Commands::Assess { patch_set, config } => cmd_assess(&patch_set, config.as_deref()),
        Commands::Detect { repo } => cmd_detect(&repo),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

/// Command-line budget and state overrides, applied after file and environment.
#[derive(Debug, Default)]
struct Overrides {
    max_iterations: Option<u32>,
    max_cost: Option<f64>,
    max_duration: Option<u64>,
    state_dir: Option<PathBuf>,
}

fn load_config(path: Option<&Path>, overrides: Overrides, run: &RunArgs) -> Result<PatcherConfig> {
    let mut config = PatcherConfig::load(path).context("Failed to load configuration")?;
    if let Some(n) = overrides.max_iterations {
        config.budgets.max_iterations = n;
    }
    if let Some(usd) = overrides.max_cost {
        config.budgets.max_cost_usd = usd;
    }
    if let Some(secs) = overrides.max_duration {
        config.budgets.max_duration_secs = secs;
    }
    if overrides.state_dir.is_some() {
        config.state_dir = overrides.state_dir;
    }
    if run.test_command.is_some() {
        config.runtime.test_command = run.test_command.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

type PlannerHandle = (Arc<dyn Planner>, Option<ResilientClient<ChatBackend>>);

fn build_planner(config: &PatcherConfig, offline: bool) -> Result<PlannerHandle> {
    if offline {
        let planner = ImportFixPlanner::new(config.repair.import_confidence_threshold);
        return Ok((Arc::new(planner), None));
    }
    let backend = ChatBackend::from_env()
        .context("Failed to configure reasoning backend (use --offline to run without one)")?;
    info!(model = %backend.config().model, "using reasoning backend");
    let client = ResilientClient::new(backend, config.resilience.clone());
    Ok((Arc::new(BackendPlanner::new(client.clone())), Some(client)))
}

async fn run_session(
    mut machine: RepairStateMachine,
    client: Option<ResilientClient<ChatBackend>>,
) -> Result<u8> {
    let outcome = machine.run().await;
    let mut report = machine
        .report()
        .context("Session ended without a terminal outcome")?;
    if let Some(client) = client {
        let stats: ResilienceStats = client.stats();
        report = report.with_resilience(stats);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_code(outcome.status))
}

async fn cmd_fix(repo: &Path, overrides: Overrides, run: &RunArgs) -> Result<u8> {
    if !repo.is_dir() {
        bail!("repository {} is not a directory", repo.display());
    }
    let repo = repo
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", repo.display()))?;
    let config = load_config(run.config.as_deref(), overrides, run)?;
    let store = SnapshotStore::new(config.state_dir_for(&repo))
        .context("Failed to open snapshot directory")?;
    let (planner, client) = build_planner(&config, run.offline)?;

    let machine = RepairStateMachine::new(&repo, config, planner, Arc::new(SubprocessExecutor))
        .context("Failed to start repair session")?
        .with_snapshot_store(Arc::new(store));
    info!(session = %machine.session().id(), repo = %repo.display(), "starting repair session");
    run_session(machine, client).await
}

async fn cmd_resume(snapshot_path: &Path, run: &RunArgs) -> Result<u8> {
    let snapshot = load_snapshot(snapshot_path)
        .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?;
    let dir = snapshot_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let store = SnapshotStore::new(dir).context("Failed to open snapshot directory")?;
    let config = load_config(run.config.as_deref(), Overrides::default(), run)?;
    let (planner, client) = build_planner(&config, run.offline)?;

    info!(
        session = %snapshot.session.id(),
        revision = snapshot.revision,
        state = %snapshot.session.state(),
        "resuming repair session"
    );
    let machine = RepairStateMachine::resume(snapshot, config, planner, Arc::new(SubprocessExecutor))
        .context("Failed to resume repair session")?
        .with_snapshot_store(Arc::new(store));
    run_session(machine, client).await
}

fn cmd_assess(path: &Path, config_path: Option<&Path>) -> Result<u8> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let patch_set: PatchSet = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid patch set", path.display()))?;
    let config = PatcherConfig::load(config_path).context("Failed to load configuration")?;
    let engine = SafetyEngine::new(config.safety).context("Invalid safety policy")?;
    let assessment = engine.assess(&patch_set);
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(0)
}

fn cmd_detect(repo: &Path) -> Result<u8> {
    let scores = score_languages(repo)
        .with_context(|| format!("Failed to scan {}", repo.display()))?;
    let runtime = ResolvedRuntime::resolve(repo, None)
        .with_context(|| format!("No supported runtime in {}", repo.display()))?;
    let manifest = runtime.runtime.read_dependency_manifest(repo).ok();
    let out = json!({
        "runtime": runtime,
        "scores": scores
            .iter()
            .map(|s| json!({ "runtime": s.runtime, "score": s.score }))
            .collect::<Vec<_>>(),
        "manifest": manifest,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(0)
}
