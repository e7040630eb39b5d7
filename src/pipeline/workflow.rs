//! The end-to-end workflow: environment, synthesis, validation, check.
//!
//! Stages run strictly in order. Each one plans from the ledgers on disk, so
//! re-running an interrupted workflow only performs the missing work.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::config::PipelineConfig;
use super::planner::ResumeMode;
use super::progress::StageReport;
use super::runner::StageRunner;
use super::stages::{
    load, CheckStage, EnvironmentStage, Stage, StageContext, SynthesisStage, ValidationStage,
    SYNTHESIS,
};
use crate::check::{GitPodmanProvider, ProtocolCheckWorker};
use crate::container::{
    CommandEnvironmentBuilder, ContainerRuntime, EnvironmentBuilder, PodmanRuntime,
};
use crate::error::{LedgerError, PipelineError};
use crate::ledger::Ledger;
use crate::task::{CandidateTask, CheckResult, Keyed, ValidatedTask, Verdict};
use crate::workers::{CommandWorker, SynthesisRequest, ValidationRequest, Worker};

/// The external collaborators of a workflow run.
#[derive(Clone)]
pub struct WorkflowWorkers {
    pub environment: Arc<dyn EnvironmentBuilder>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub synthesis: Arc<dyn Worker<SynthesisRequest, CandidateTask>>,
    pub validation: Arc<dyn Worker<ValidationRequest, ValidatedTask>>,
    pub check: Arc<dyn Worker<ValidatedTask, CheckResult>>,
}

impl WorkflowWorkers {
    /// Command-backed workers from configuration.
    ///
    /// The environment, synthesis and validation commands are required. The
    /// check stage uses `check_command` when set and the built-in
    /// git + container protocol otherwise.
    pub fn from_config(config: &PipelineConfig, ctx: &StageContext) -> Result<Self, PipelineError> {
        let runtime = PodmanRuntime::new(config.container_runtime.clone());
        let shared_runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime.clone());

        let env_command = PipelineConfig::require_command(&config.env_command, "BENCH_FORGE_ENV_COMMAND")?;
        let synth_command =
            PipelineConfig::require_command(&config.synth_command, "BENCH_FORGE_SYNTH_COMMAND")?;
        let validate_command =
            PipelineConfig::require_command(&config.validate_command, "BENCH_FORGE_VALIDATE_COMMAND")?;

        let agent = |name: &str, command: &str| {
            CommandWorker::new(name, command)
                .with_workdir(ctx.worktree.clone())
                .with_env("BENCH_FORGE_CONTAINER", ctx.container.clone())
                .with_env("BENCH_FORGE_STATE_DIR", ctx.paths.root().display().to_string())
        };

        let check: Arc<dyn Worker<ValidatedTask, CheckResult>> = match config.check_command.as_deref() {
            Some(command) => Arc::new(agent("check", command)),
            None => Arc::new(ProtocolCheckWorker::new(Arc::new(GitPodmanProvider::new(
                runtime,
                config.check_timeout,
            )))),
        };

        Ok(Self {
            environment: Arc::new(CommandEnvironmentBuilder::new(env_command, shared_runtime.clone())),
            runtime: shared_runtime,
            synthesis: Arc::new(agent("synthesis", synth_command)),
            validation: Arc::new(agent("validation", validate_command)),
            check,
        })
    }
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub state_dir: PathBuf,
    pub container: String,
    pub commit_sha: String,
    pub stages: Vec<StageReport>,
    /// Distinct candidate task ids.
    pub candidates: usize,
    /// Distinct validated task ids.
    pub validated: usize,
    /// Validated tasks with at least one check result.
    pub checked: usize,
    pub passed: usize,
    pub failed: usize,
}

impl WorkflowSummary {
    /// No validated task's latest verdict is a failure.
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// One repository's pass through all four stages.
pub struct Workflow {
    ctx: Arc<StageContext>,
    target: usize,
    mode: ResumeMode,
    environment: EnvironmentStage,
    synthesis: SynthesisStage,
    validation: ValidationStage,
    check: CheckStage,
}

impl Workflow {
    pub fn new(
        config: &PipelineConfig,
        ctx: StageContext,
        matching_files: Vec<String>,
        workers: WorkflowWorkers,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        ctx.paths
            .ensure()
            .map_err(|e| LedgerError::io(ctx.paths.root(), e))?;
        let ctx = Arc::new(ctx);

        Ok(Self {
            target: config.target_candidates,
            mode: ResumeMode::from_force_fresh(config.force_fresh),
            environment: EnvironmentStage::new(
                ctx.clone(),
                workers.environment,
                workers.runtime,
                config.step_timeout,
            )?,
            synthesis: SynthesisStage::new(ctx.clone(), workers.synthesis, matching_files, config.step_timeout)?,
            validation: ValidationStage::new(
                ctx.clone(),
                workers.validation,
                StageRunner::new(config.validation_workers, config.step_timeout),
            )?,
            check: CheckStage::new(
                ctx.clone(),
                workers.check,
                StageRunner::new(config.check_workers, config.step_timeout),
            )?,
            ctx,
        })
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Items each stage would attempt right now, in stage order.
    ///
    /// Downstream counts reflect the ledgers as they are, not the output the
    /// upstream stages are about to produce.
    pub fn plan(&self) -> Result<Vec<(&'static str, usize)>, PipelineError> {
        let candidates = Ledger::<CandidateTask>::open(self.ctx.paths.tasks())?.read_all()?;
        let validated = Ledger::<ValidatedTask>::open(self.ctx.paths.validated())?.read_all()?;
        let (candidates, validated) = (distinct_ids(&candidates).len(), distinct_ids(&validated).len());
        Ok(vec![
            (self.environment.name(), self.environment.plan(1, self.mode)?),
            (self.synthesis.name(), self.synthesis.plan(self.target, self.mode)?),
            (self.validation.name(), self.validation.plan(candidates, self.mode)?),
            (self.check.name(), self.check.plan(validated, self.mode)?),
        ])
    }

    pub async fn run(&self) -> Result<WorkflowSummary, PipelineError> {
        info!(
            repo = %self.ctx.repo,
            commit = %self.ctx.commit_sha,
            container = %self.ctx.container,
            state_dir = %self.ctx.paths.root().display(),
            target = self.target,
            mode = ?self.mode,
            "START: workflow"
        );

        let mut stages = Vec::with_capacity(4);
        stages.push(self.environment.run(1, self.mode).await?);
        stages.push(self.synthesis.run(self.target, self.mode).await?);

        let candidates = load(&Ledger::<CandidateTask>::open(self.ctx.paths.tasks())?).await?;
        if self.target > 0 && candidates.is_empty() {
            return Err(PipelineError::NoProgress {
                stage: SYNTHESIS.to_string(),
                reason: "no candidate tasks exist after synthesis".to_string(),
            });
        }
        let candidate_ids = distinct_ids(&candidates);
        stages.push(self.validation.run(candidate_ids.len(), self.mode).await?);

        let validated = load(&Ledger::<ValidatedTask>::open(self.ctx.paths.validated())?).await?;
        let validated_ids = distinct_ids(&validated);
        if validated_ids.is_empty() {
            warn!("No candidate passed validation; nothing to check");
        }
        stages.push(self.check.run(validated_ids.len(), self.mode).await?);

        let checks = load(&Ledger::<CheckResult>::open(self.ctx.paths.checks())?).await?;
        let latest = latest_verdicts(&checks);
        let verdicts: Vec<Verdict> = validated_ids
            .iter()
            .filter_map(|id| latest.get(id.as_str()).copied())
            .collect();
        let passed = verdicts.iter().filter(|v| v.is_pass()).count();

        let summary = WorkflowSummary {
            state_dir: self.ctx.paths.root().to_path_buf(),
            container: self.ctx.container.clone(),
            commit_sha: self.ctx.commit_sha.clone(),
            stages,
            candidates: candidate_ids.len(),
            validated: validated_ids.len(),
            checked: verdicts.len(),
            passed,
            failed: verdicts.len() - passed,
        };
        info!(
            candidates = summary.candidates,
            validated = summary.validated,
            checked = summary.checked,
            passed = summary.passed,
            failed = summary.failed,
            "END: workflow"
        );
        Ok(summary)
    }
}

/// Task ids of `records`, each once.
fn distinct_ids<T: Keyed>(records: &[T]) -> BTreeSet<String> {
    records.iter().filter_map(Keyed::task_key).collect()
}

/// Last verdict per task id; later lines win.
fn latest_verdicts(checks: &[CheckResult]) -> HashMap<String, Verdict> {
    checks
        .iter()
        .map(|check| (check.task_id.to_string(), check.verdict))
        .collect()
}
