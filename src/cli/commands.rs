//! CLI command definitions for bench-forge.
//!
//! `run` drives one repository through the resumable workflow; `merge`,
//! `validate` and `status` work on finished state directories.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::container::standard_container_name;
use crate::dataset::{merge, CollisionPolicy, Dataset, MergeReport, SchemaValidator};
use crate::ledger::{default_state_dir, Ledger, StatePaths};
use crate::pipeline::{PipelineConfig, StageContext, Workflow, WorkflowSummary, WorkflowWorkers};
use crate::repo::{find_matching_files, RepoSnapshot};
use crate::task::{Keyed, Record};

/// Resumable benchmark task synthesis for a code repository.
#[derive(Parser)]
#[command(name = "bench-forge")]
#[command(about = "Synthesize, validate and check feature re-implementation tasks")]
#[command(version)]
#[command(
    long_about = "bench-forge builds a container environment for a repository, asks coding agents for candidate tasks, validates them and checks each validated task with an apply / fail / reverse test protocol.\n\nEvery stage appends to a JSONL ledger in the state directory, so re-running the same command resumes where the last run stopped.\n\nExample usage:\n  bench-forge run ./scheme.tar.gz 'src/**/*.scm' --num-candidates 5"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Extra log file for commands that own a state directory.
    pub fn log_file(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Run(args) => {
                let config = args.to_config().ok()?;
                Some(StatePaths::new(args.state_dir(&config)).workflow_log())
            }
            _ => None,
        }
    }
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the environment, synthesis, validation and check stages.
    Run(RunArgs),

    /// Merge a new dataset into an existing one without reusing task ids.
    Merge(MergeArgs),

    /// Check a dataset against the publish schema.
    Validate(ValidateArgs),

    /// Show ledger counts and pending work for a state directory.
    Status(StatusArgs),
}

/// Arguments for `bench-forge run`.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Repository directory, or a .tar/.tar.gz/.tgz holding a bare git repository.
    pub repo: PathBuf,

    /// Glob patterns selecting the files tasks may target (e.g. 'src/**/*.py').
    #[arg(required = true)]
    pub patterns: Vec<String>,

    /// Number of candidate tasks to synthesize.
    #[arg(short = 'n', long)]
    pub num_candidates: Option<usize>,

    /// Plan every stage as if its ledger were empty. Nothing is deleted.
    #[arg(long)]
    pub force_fresh: bool,

    /// State directory (default: workflow_state/<repo label>).
    #[arg(long, env = "BENCH_FORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Container image name (default: env_agent__<repo label>).
    #[arg(long)]
    pub container: Option<String>,

    /// Parallel validation workers.
    #[arg(long)]
    pub validation_workers: Option<usize>,

    /// Parallel check workers.
    #[arg(long)]
    pub check_workers: Option<usize>,

    /// Command producing one candidate task per call.
    #[arg(long, env = "BENCH_FORGE_SYNTH_COMMAND")]
    pub synth_command: Option<String>,

    /// Command validating one candidate per call.
    #[arg(long, env = "BENCH_FORGE_VALIDATE_COMMAND")]
    pub validate_command: Option<String>,

    /// Command building the container environment.
    #[arg(long, env = "BENCH_FORGE_ENV_COMMAND")]
    pub env_command: Option<String>,

    /// Command checking one validated task (default: built-in test protocol).
    #[arg(long, env = "BENCH_FORGE_CHECK_COMMAND")]
    pub check_command: Option<String>,

    /// Timeout for one agent call.
    #[arg(long)]
    pub step_timeout_seconds: Option<u64>,

    /// Timeout for one test-suite run during checks.
    #[arg(long)]
    pub check_timeout_seconds: Option<u64>,

    /// Print the workflow summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Environment configuration with command-line overrides applied.
    pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = PipelineConfig::from_env()?.with_force_fresh(self.force_fresh);
        if let Some(n) = self.num_candidates {
            config = config.with_target_candidates(n);
        }
        if let Some(dir) = &self.state_dir {
            config = config.with_state_dir(dir);
        }
        if let Some(container) = &self.container {
            config = config.with_container(container);
        }
        if let Some(workers) = self.validation_workers {
            config = config.with_validation_workers(workers);
        }
        if let Some(workers) = self.check_workers {
            config = config.with_check_workers(workers);
        }
        if let Some(command) = &self.synth_command {
            config = config.with_synth_command(command);
        }
        if let Some(command) = &self.validate_command {
            config = config.with_validate_command(command);
        }
        if let Some(command) = &self.env_command {
            config = config.with_env_command(command);
        }
        if let Some(command) = &self.check_command {
            config = config.with_check_command(command);
        }
        if let Some(secs) = self.step_timeout_seconds {
            config = config.with_step_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.check_timeout_seconds {
            config = config.with_check_timeout(Duration::from_secs(secs));
        }
        config.validate()?;
        Ok(config)
    }

    fn source(&self) -> PathBuf {
        std::fs::canonicalize(&self.repo).unwrap_or_else(|_| self.repo.clone())
    }

    pub fn state_dir(&self, config: &PipelineConfig) -> PathBuf {
        config.resolve_state_dir(&self.source())
    }
}

/// Arguments for `bench-forge merge`.
#[derive(Parser, Debug)]
pub struct MergeArgs {
    /// Published dataset to merge into. Only ever appended to.
    pub existing: PathBuf,

    /// Dataset to merge. Duplicate task ids are compacted first (latest wins).
    pub new: PathBuf,

    /// What to do with a new task whose id already exists: skip or renumber.
    #[arg(long, default_value = "skip")]
    pub policy: CollisionPolicy,

    /// Report what would be merged without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub json: bool,
}

/// Arguments for `bench-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Dataset (state) directory.
    pub dir: PathBuf,

    /// Validate the latest record per task id instead of every line.
    #[arg(long)]
    pub compact: bool,

    #[arg(long)]
    pub json: bool,
}

/// Arguments for `bench-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// State directory, or the repository whose default state directory to read.
    pub dir: PathBuf,

    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_workflow_command(args).await,
        Commands::Merge(args) => run_merge_command(args),
        Commands::Validate(args) => run_validate_command(args),
        Commands::Status(args) => run_status_command(args),
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_workflow_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = args.to_config()?;
    let snapshot = RepoSnapshot::open(&args.repo).await?;
    let matching_files = find_matching_files(snapshot.worktree(), &args.patterns)?;
    info!(
        files = matching_files.len(),
        patterns = %args.patterns.join(", "),
        "Selected target files"
    );

    let paths = StatePaths::new(config.resolve_state_dir(snapshot.source()));
    let container = config
        .container
        .clone()
        .unwrap_or_else(|| standard_container_name(snapshot.source()));
    let ctx = StageContext::from_snapshot(&snapshot, container, paths);
    let workers = WorkflowWorkers::from_config(&config, &ctx)?;
    let workflow = Workflow::new(&config, ctx, matching_files, workers)?;
    for (stage, planned) in workflow.plan()? {
        info!(stage = stage, planned = planned, "Initial plan");
    }

    let summary = workflow.run().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(exit_code(summary.success()))
}

fn print_summary(summary: &WorkflowSummary) {
    println!("\n=== Workflow Results ===");
    println!("State dir:   {}", summary.state_dir.display());
    println!("Container:   {}", summary.container);
    println!("Commit:      {}", summary.commit_sha);
    for stage in &summary.stages {
        if stage.skipped {
            println!("  {:<11} skipped", stage.stage);
        } else {
            println!(
                "  {:<11} planned={} appended={} failed={}",
                stage.stage, stage.planned, stage.appended, stage.failed
            );
        }
    }
    println!("Candidates:  {}", summary.candidates);
    println!("Validated:   {}", summary.validated);
    println!("Checked:     {}", summary.checked);
    println!("Passed:      {}", summary.passed);
    println!("Failed:      {}", summary.failed);
}

// ============================================================================
// merge
// ============================================================================

#[derive(Debug, Serialize)]
struct MergeOutput {
    status: String,
    policy: String,
    dry_run: bool,
    #[serde(flatten)]
    report: MergeReport,
    renames: std::collections::BTreeMap<String, String>,
    appended: usize,
    digest: String,
}

fn run_merge_command(args: MergeArgs) -> anyhow::Result<ExitCode> {
    let existing = Dataset::load(&args.existing)?;
    let new = Dataset::load(&args.new)?.compact();
    let outcome = merge(&existing, &new, args.policy)?;

    let appended = outcome.additions.candidates.len()
        + outcome.additions.validated.len()
        + outcome.additions.checks.len();
    if !args.dry_run {
        outcome.additions.write_to(&args.existing)?;
    }

    let output = MergeOutput {
        status: if args.dry_run { "dry_run" } else { "merged" }.to_string(),
        policy: args.policy.to_string(),
        dry_run: args.dry_run,
        report: outcome.report,
        renames: outcome.renames,
        appended,
        digest: outcome.dataset.digest(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Policy:      {}", output.policy);
        println!("Carried:     {}", output.report.carried);
        println!("Skipped:     {}", output.report.skipped);
        println!("Renumbered:  {}", output.report.renumbered);
        for (from, to) in &output.renames {
            println!("  {from} -> {to}");
        }
        println!("Records:     {}{}", output.appended, if args.dry_run { " (dry run)" } else { "" });
        println!("Digest:      {}", output.digest);
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// validate
// ============================================================================

fn run_validate_command(args: ValidateArgs) -> anyhow::Result<ExitCode> {
    let mut dataset = Dataset::load(&args.dir)?;
    if args.compact {
        dataset = dataset.compact();
    }
    let result = SchemaValidator::validate(&dataset);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for violation in result.violations() {
            println!("error: {violation}");
        }
        for warning in &result.warnings {
            println!("warning: {}: {}", warning.field, warning.message);
        }
        println!(
            "{}: {} error(s), {} warning(s)",
            if result.valid { "valid" } else { "invalid" },
            result.errors.len(),
            result.warnings.len()
        );
    }
    Ok(exit_code(result.valid))
}

// ============================================================================
// status
// ============================================================================

#[derive(Debug, Serialize)]
struct StatusOutput {
    state_dir: PathBuf,
    environments: usize,
    candidates: usize,
    validated: usize,
    checks: usize,
    pending_validation: Vec<String>,
    pending_check: Vec<String>,
    passed: usize,
    failed: usize,
    digest: String,
}

fn resolve_status_dir(dir: &Path) -> PathBuf {
    if StatePaths::new(dir).tasks().exists() {
        return dir.to_path_buf();
    }
    let source = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let fallback = default_state_dir(&source);
    if fallback.is_dir() {
        fallback
    } else {
        dir.to_path_buf()
    }
}

fn pending(upstream: &[Record], own: &[Record]) -> Vec<String> {
    let done: BTreeSet<String> = own.iter().filter_map(Keyed::task_key).collect();
    let mut seen = BTreeSet::new();
    upstream
        .iter()
        .filter_map(Keyed::task_key)
        .filter(|id| !done.contains(id) && seen.insert(id.clone()))
        .collect()
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<ExitCode> {
    let dir = resolve_status_dir(&args.dir);
    let dataset = Dataset::load(&dir)?;
    let environments = Ledger::<Record>::open(StatePaths::new(&dir).environment())?.count()?;

    let latest: HashMap<String, bool> = dataset
        .checks
        .iter()
        .filter_map(|r| Some((r.task_key()?, r.get("verdict")?.as_str()? == "pass")))
        .collect();
    let validated_ids: BTreeSet<String> = dataset.validated.iter().filter_map(Keyed::task_key).collect();
    let passed = validated_ids.iter().filter(|id| latest.get(*id) == Some(&true)).count();
    let failed = validated_ids.iter().filter(|id| latest.get(*id) == Some(&false)).count();

    let output = StatusOutput {
        environments,
        candidates: dataset.candidates.len(),
        validated: dataset.validated.len(),
        checks: dataset.checks.len(),
        pending_validation: pending(&dataset.candidates, &dataset.validated),
        pending_check: pending(&dataset.validated, &dataset.checks),
        passed,
        failed,
        digest: dataset.digest(),
        state_dir: dir,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("State dir:   {}", output.state_dir.display());
        println!("Environment: {}", output.environments);
        println!("Candidates:  {}", output.candidates);
        println!(
            "Validated:   {} ({} pending)",
            output.validated,
            output.pending_validation.len()
        );
        println!("Checks:      {} ({} pending)", output.checks, output.pending_check.len());
        println!("Passed:      {}", output.passed);
        println!("Failed:      {}", output.failed);
        println!("Digest:      {}", output.digest);
    }
    Ok(ExitCode::SUCCESS)
}
