//! The four pipeline stages.
//!
//! Each stage owns one output ledger and plans its work purely from ledger
//! contents:
//!
//! - environment: one record per (repo, commit, container), built once;
//! - synthesis: candidates up to the requested target, one agent call each;
//! - validation: one validated record per candidate, keyed by `task_id`;
//! - check: one verdict per validated task, keyed by `task_id`.
//!
//! Every stage after the environment refuses to run without a matching
//! environment record.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::planner::{remaining_count, remaining_work, ResumeMode};
use super::progress::{StageCounters, StageReport};
use super::runner::StageRunner;
use crate::container::{ContainerRuntime, EnvironmentBuilder, EnvironmentRequest};
use crate::error::{PipelineError, WorkerError};
use crate::ledger::{Ledger, StatePaths};
use crate::repo::RepoSnapshot;
use crate::task::{CandidateTask, CheckResult, EnvironmentRecord, TaskId, ValidatedTask};
use crate::workers::{SynthesisRequest, ValidationRequest, Worker};

pub const ENVIRONMENT: &str = "environment";
pub const SYNTHESIS: &str = "synthesis";
pub const VALIDATION: &str = "validation";
pub const CHECK: &str = "check";

/// A pipeline stage: consumes upstream ledgers, appends to its own.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of work items a run with this target would attempt.
    fn plan(&self, target: usize, mode: ResumeMode) -> Result<usize, PipelineError>;

    async fn run(&self, target: usize, mode: ResumeMode) -> Result<StageReport, PipelineError>;
}

/// What every stage knows about the repository being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub repo: String,
    pub commit_sha: String,
    pub worktree: PathBuf,
    /// Task id prefix for synthesized candidates.
    pub label: String,
    pub container: String,
    pub paths: StatePaths,
}

impl StageContext {
    pub fn from_snapshot(snapshot: &RepoSnapshot, container: impl Into<String>, paths: StatePaths) -> Self {
        Self {
            repo: snapshot.repo(),
            commit_sha: snapshot.commit_sha().to_string(),
            worktree: snapshot.worktree().to_path_buf(),
            label: snapshot.label().to_string(),
            container: container.into(),
            paths,
        }
    }

    pub fn environment_request(&self) -> EnvironmentRequest {
        EnvironmentRequest {
            repo: self.repo.clone(),
            commit_sha: self.commit_sha.clone(),
            worktree: self.worktree.display().to_string(),
            container: self.container.clone(),
        }
    }

    fn matches(&self, record: &EnvironmentRecord) -> bool {
        record.matches(&self.repo, &self.commit_sha) && record.container == self.container
    }

    /// Latest environment record for this repository, commit and container.
    pub fn find_environment<'a>(&self, records: &'a [EnvironmentRecord]) -> Option<&'a EnvironmentRecord> {
        records.iter().rev().find(|r| self.matches(r))
    }

    /// Like [`find_environment`](Self::find_environment), but a missing record
    /// is a `PreconditionMissing` error for `stage`.
    pub fn require_environment(
        &self,
        stage: &str,
        records: &[EnvironmentRecord],
    ) -> Result<EnvironmentRecord, PipelineError> {
        self.find_environment(records)
            .cloned()
            .ok_or_else(|| PipelineError::PreconditionMissing {
                stage: stage.to_string(),
                reason: format!(
                    "no environment record for {} at {} (container {})",
                    self.repo, self.commit_sha, self.container
                ),
            })
    }
}

/// Reads a ledger without blocking the runtime.
pub(crate) async fn load<T>(ledger: &Ledger<T>) -> Result<Vec<T>, PipelineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let ledger = ledger.clone();
    Ok(tokio::task::spawn_blocking(move || ledger.read_all()).await??)
}

async fn append<T>(ledger: &Ledger<T>, record: T) -> Result<(), PipelineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let ledger = ledger.clone();
    Ok(tokio::task::spawn_blocking(move || ledger.append(&record)).await??)
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Builds the container environment once and records it.
pub struct EnvironmentStage {
    ctx: Arc<StageContext>,
    ledger: Ledger<EnvironmentRecord>,
    builder: Arc<dyn EnvironmentBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl EnvironmentStage {
    pub fn new(
        ctx: Arc<StageContext>,
        builder: Arc<dyn EnvironmentBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let ledger = Ledger::open(ctx.paths.environment())?;
        Ok(Self {
            ctx,
            ledger,
            builder,
            runtime,
            timeout,
        })
    }

    async fn image_present(&self, container: &str) -> bool {
        match self.runtime.image_exists(container).await {
            Ok(present) => present,
            Err(e) => {
                warn!(container = container, error = %e, "Cannot query container runtime");
                false
            }
        }
    }
}

#[async_trait]
impl Stage for EnvironmentStage {
    fn name(&self) -> &'static str {
        ENVIRONMENT
    }

    fn plan(&self, target: usize, mode: ResumeMode) -> Result<usize, PipelineError> {
        let records = self.ledger.read_all()?;
        let current = usize::from(self.ctx.find_environment(&records).is_some());
        Ok(remaining_count(target.min(1), current, mode))
    }

    async fn run(&self, target: usize, mode: ResumeMode) -> Result<StageReport, PipelineError> {
        if target == 0 {
            return Ok(StageReport::skipped(ENVIRONMENT));
        }
        let records = load(&self.ledger).await?;
        if mode == ResumeMode::Resume {
            if let Some(existing) = self.ctx.find_environment(&records) {
                if self.image_present(&existing.container).await {
                    info!(
                        stage = ENVIRONMENT,
                        container = %existing.container,
                        "SKIP: environment already built"
                    );
                    return Ok(StageReport::skipped(ENVIRONMENT));
                }
                warn!(
                    stage = ENVIRONMENT,
                    container = %existing.container,
                    "Environment record exists but the image is gone, rebuilding"
                );
            }
        }

        let request = self.ctx.environment_request();
        info!(stage = ENVIRONMENT, container = %request.container, "START: building environment");
        let built = match tokio::time::timeout(self.timeout, self.builder.build(&request)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        };
        let record = built.map_err(|e| PipelineError::PreconditionMissing {
            stage: ENVIRONMENT.to_string(),
            reason: format!("environment build failed: {e}"),
        })?;
        if !self.ctx.matches(&record) {
            return Err(PipelineError::PreconditionMissing {
                stage: ENVIRONMENT.to_string(),
                reason: format!(
                    "builder returned an environment for {} at {} (container {})",
                    record.repo, record.commit_sha, record.container
                ),
            });
        }

        info!(
            stage = ENVIRONMENT,
            container = %record.container,
            artifact_hash = %record.artifact_hash,
            "END: environment built"
        );
        append(&self.ledger, record).await?;
        Ok(StageReport {
            stage: ENVIRONMENT.to_string(),
            planned: 1,
            appended: 1,
            failed: 0,
            skipped: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Forces the identity fields a synthesis agent is not allowed to choose.
struct StampCandidate {
    inner: Arc<dyn Worker<SynthesisRequest, CandidateTask>>,
}

#[async_trait]
impl Worker<SynthesisRequest, CandidateTask> for StampCandidate {
    async fn invoke(&self, request: SynthesisRequest) -> Result<CandidateTask, WorkerError> {
        let task_id = request.task_id.clone();
        let repo = request.repo.clone();
        let commit_sha = request.commit_sha.clone();
        let matching_files = request.matching_files.clone();

        let mut candidate = self.inner.invoke(request).await?;
        if candidate.subject.trim().is_empty() || candidate.patches.trim().is_empty() {
            return Err(WorkerError::BadOutput(
                "candidate has an empty subject or no patches".to_string(),
            ));
        }
        if candidate.task_id != task_id {
            debug!(returned = %candidate.task_id, assigned = %task_id, "Replacing agent-chosen task id");
        }
        candidate.task_id = task_id;
        candidate.repo = repo;
        candidate.commit_sha = commit_sha;
        if candidate.matching_files.is_empty() {
            candidate.matching_files = matching_files;
        }
        Ok(candidate)
    }
}

/// Synthesizes candidates one at a time until the ledger reaches the target.
pub struct SynthesisStage {
    ctx: Arc<StageContext>,
    environments: Ledger<EnvironmentRecord>,
    ledger: Ledger<CandidateTask>,
    worker: StampCandidate,
    matching_files: Vec<String>,
    runner: StageRunner,
}

impl SynthesisStage {
    pub fn new(
        ctx: Arc<StageContext>,
        worker: Arc<dyn Worker<SynthesisRequest, CandidateTask>>,
        matching_files: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            environments: Ledger::open(ctx.paths.environment())?,
            ledger: Ledger::open(ctx.paths.tasks())?,
            ctx,
            worker: StampCandidate { inner: worker },
            matching_files,
            runner: StageRunner::sequential(timeout),
        })
    }

    fn next_request(
        &self,
        existing: &[CandidateTask],
        container: &str,
    ) -> Result<SynthesisRequest, PipelineError> {
        let ids: Vec<String> = existing.iter().map(|c| c.task_id.to_string()).collect();
        let task_id = TaskId::next_in(&self.ctx.label, ids.iter().map(String::as_str))
            .map_err(|e| PipelineError::Repository(format!("cannot derive task id: {e}")))?;
        Ok(SynthesisRequest {
            task_id,
            repo: self.ctx.repo.clone(),
            commit_sha: self.ctx.commit_sha.clone(),
            worktree: self.ctx.worktree.display().to_string(),
            container: container.to_string(),
            matching_files: self.matching_files.clone(),
            avoid_subjects: existing
                .iter()
                .map(|c| c.subject.clone())
                .filter(|s| !s.trim().is_empty())
                .collect(),
        })
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> &'static str {
        SYNTHESIS
    }

    fn plan(&self, target: usize, mode: ResumeMode) -> Result<usize, PipelineError> {
        Ok(remaining_count(target, self.ledger.count()?, mode))
    }

    async fn run(&self, target: usize, mode: ResumeMode) -> Result<StageReport, PipelineError> {
        let environment = self
            .ctx
            .require_environment(SYNTHESIS, &load(&self.environments).await?)?;

        let existing = load(&self.ledger).await?;
        let deficit = remaining_count(target, existing.len(), mode);
        if deficit == 0 {
            info!(
                stage = SYNTHESIS,
                have = existing.len(),
                target = target,
                "SKIP: candidate target already met"
            );
            return Ok(StageReport::skipped(SYNTHESIS));
        }

        info!(stage = SYNTHESIS, remaining = deficit, target = target, "START: synthesizing candidates");
        let counters = StageCounters::new();
        counters.planned.store(deficit, Ordering::Relaxed);
        let mut existing = existing;
        for attempt in 0..deficit {
            if attempt > 0 {
                existing = load(&self.ledger).await?;
            }
            let request = self.next_request(&existing, &environment.container)?;
            let task_id = request.task_id.to_string();
            self.runner
                .run_one(SYNTHESIS, &task_id, request, &self.worker, &self.ledger, &counters)
                .await?;
        }

        let report = StageReport::from_counters(SYNTHESIS, &counters);
        info!(
            stage = SYNTHESIS,
            appended = report.appended,
            failed = report.failed,
            "END: synthesis finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Rejects validated records that rename their task or lack a diff.
struct RenameGuard {
    inner: Arc<dyn Worker<ValidationRequest, ValidatedTask>>,
}

#[async_trait]
impl Worker<ValidationRequest, ValidatedTask> for RenameGuard {
    async fn invoke(&self, request: ValidationRequest) -> Result<ValidatedTask, WorkerError> {
        let expected = request.candidate.task_id.clone();
        let validated = self.inner.invoke(request).await?;
        if validated.task_id != expected {
            return Err(WorkerError::Failed(format!(
                "validation renamed task {expected} to {}",
                validated.task_id
            )));
        }
        if validated.src_diff.trim().is_empty() || validated.tests_diff.trim().is_empty() {
            return Err(WorkerError::BadOutput(format!(
                "validated task {expected} is missing src.diff or tests.diff"
            )));
        }
        Ok(validated)
    }
}

/// Validates each candidate that has no validated record yet.
pub struct ValidationStage {
    ctx: Arc<StageContext>,
    environments: Ledger<EnvironmentRecord>,
    candidates: Ledger<CandidateTask>,
    ledger: Ledger<ValidatedTask>,
    worker: RenameGuard,
    runner: StageRunner,
}

impl ValidationStage {
    pub fn new(
        ctx: Arc<StageContext>,
        worker: Arc<dyn Worker<ValidationRequest, ValidatedTask>>,
        runner: StageRunner,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            environments: Ledger::open(ctx.paths.environment())?,
            candidates: Ledger::open(ctx.paths.tasks())?,
            ledger: Ledger::open(ctx.paths.validated())?,
            ctx,
            worker: RenameGuard { inner: worker },
            runner,
        })
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &'static str {
        VALIDATION
    }

    fn plan(&self, target: usize, mode: ResumeMode) -> Result<usize, PipelineError> {
        let upstream = self.candidates.read_all()?;
        let own = self.ledger.read_all()?;
        Ok(remaining_work(&upstream, &own, target, mode).len())
    }

    async fn run(&self, target: usize, mode: ResumeMode) -> Result<StageReport, PipelineError> {
        let environment = self
            .ctx
            .require_environment(VALIDATION, &load(&self.environments).await?)?;

        let upstream = load(&self.candidates).await?;
        let own = load(&self.ledger).await?;
        let plan = remaining_work(&upstream, &own, target, mode);
        if plan.is_empty() {
            info!(
                stage = VALIDATION,
                validated = own.len(),
                candidates = upstream.len(),
                "SKIP: every candidate already validated"
            );
            return Ok(StageReport::skipped(VALIDATION));
        }

        info!(
            stage = VALIDATION,
            planned = plan.len(),
            pending = plan.pending,
            "START: validating candidates"
        );
        let container = environment.container;
        let worktree = self.ctx.worktree.display().to_string();
        let items = plan
            .items
            .into_iter()
            .map(|planned| {
                planned.map(|candidate| ValidationRequest {
                    candidate,
                    container: container.clone(),
                    worktree: worktree.clone(),
                })
            })
            .collect();
        let report = self.runner.run(VALIDATION, items, &self.worker, &self.ledger).await?;
        info!(
            stage = VALIDATION,
            appended = report.appended,
            failed = report.failed,
            "END: validation finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Checks each validated task that has no verdict yet.
pub struct CheckStage {
    ctx: Arc<StageContext>,
    environments: Ledger<EnvironmentRecord>,
    validated: Ledger<ValidatedTask>,
    ledger: Ledger<CheckResult>,
    worker: Arc<dyn Worker<ValidatedTask, CheckResult>>,
    runner: StageRunner,
}

impl CheckStage {
    pub fn new(
        ctx: Arc<StageContext>,
        worker: Arc<dyn Worker<ValidatedTask, CheckResult>>,
        runner: StageRunner,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            environments: Ledger::open(ctx.paths.environment())?,
            validated: Ledger::open(ctx.paths.validated())?,
            ledger: Ledger::open(ctx.paths.checks())?,
            ctx,
            worker,
            runner,
        })
    }
}

/// Stamps the checked task's id on whatever the check worker returns.
struct CheckIdentity<'a> {
    inner: &'a dyn Worker<ValidatedTask, CheckResult>,
}

#[async_trait]
impl Worker<ValidatedTask, CheckResult> for CheckIdentity<'_> {
    async fn invoke(&self, task: ValidatedTask) -> Result<CheckResult, WorkerError> {
        let task_id = task.task_id.clone();
        let mut result = self.inner.invoke(task).await?;
        result.task_id = task_id;
        Ok(result)
    }
}

#[async_trait]
impl Stage for CheckStage {
    fn name(&self) -> &'static str {
        CHECK
    }

    fn plan(&self, target: usize, mode: ResumeMode) -> Result<usize, PipelineError> {
        let upstream = self.validated.read_all()?;
        let own = self.ledger.read_all()?;
        Ok(remaining_work(&upstream, &own, target, mode).len())
    }

    async fn run(&self, target: usize, mode: ResumeMode) -> Result<StageReport, PipelineError> {
        self.ctx
            .require_environment(CHECK, &load(&self.environments).await?)?;

        let upstream = load(&self.validated).await?;
        let own = load(&self.ledger).await?;
        let plan = remaining_work(&upstream, &own, target, mode);
        if plan.is_empty() {
            info!(
                stage = CHECK,
                checked = own.len(),
                validated = upstream.len(),
                "SKIP: every validated task already checked"
            );
            return Ok(StageReport::skipped(CHECK));
        }

        info!(stage = CHECK, planned = plan.len(), "START: checking validated tasks");
        let worker = CheckIdentity {
            inner: self.worker.as_ref(),
        };
        let report = self.runner.run(CHECK, plan.items, &worker, &self.ledger).await?;
        info!(
            stage = CHECK,
            appended = report.appended,
            failed = report.failed,
            "END: checks finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::FnWorker;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    struct Runtime {
        present: AtomicBool,
    }

    #[async_trait]
    impl ContainerRuntime for Runtime {
        async fn image_exists(&self, _name: &str) -> Result<bool, WorkerError> {
            Ok(self.present.load(Ordering::SeqCst))
        }

        async fn image_digest(&self, _name: &str) -> Result<Option<String>, WorkerError> {
            Ok(Some("sha256:1234".to_string()))
        }
    }

    struct Builder;

    #[async_trait]
    impl EnvironmentBuilder for Builder {
        async fn build(&self, request: &EnvironmentRequest) -> Result<EnvironmentRecord, WorkerError> {
            Ok(environment(request))
        }
    }

    fn environment(request: &EnvironmentRequest) -> EnvironmentRecord {
        EnvironmentRecord {
            repo: request.repo.clone(),
            commit_sha: request.commit_sha.clone(),
            container: request.container.clone(),
            artifact_hash: "sha256:1234".to_string(),
            build_script: String::new(),
            build_log: String::new(),
            tips: String::new(),
            built_at: Utc::now(),
        }
    }

    fn context(dir: &TempDir) -> Arc<StageContext> {
        Arc::new(StageContext {
            repo: "/data/scheme".to_string(),
            commit_sha: "c0ffee".to_string(),
            worktree: dir.path().join("worktree"),
            label: "scheme".to_string(),
            container: "env_agent__scheme".to_string(),
            paths: StatePaths::new(dir.path().join("state")),
        })
    }

    fn seed_environment(ctx: &StageContext) {
        Ledger::open(ctx.paths.environment())
            .unwrap()
            .append(&environment(&ctx.environment_request()))
            .unwrap();
    }

    fn candidate(id: &str) -> CandidateTask {
        CandidateTask {
            task_id: id.parse().unwrap(),
            repo: "/data/scheme".to_string(),
            commit_sha: "c0ffee".to_string(),
            subject: "Tail calls".to_string(),
            task_description: "Re-implement tail call elimination".to_string(),
            patches: "<<<<<<< SEARCH".to_string(),
            reasoning: String::new(),
            matching_files: vec!["eval.scm".to_string()],
        }
    }

    #[tokio::test]
    async fn test_environment_rebuilds_when_image_missing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let runtime = Arc::new(Runtime {
            present: AtomicBool::new(true),
        });
        let stage = EnvironmentStage::new(ctx.clone(), Arc::new(Builder), runtime.clone(), Duration::from_secs(5)).unwrap();

        assert_eq!(stage.plan(1, ResumeMode::Resume).unwrap(), 1);
        assert_eq!(stage.run(1, ResumeMode::Resume).await.unwrap().appended, 1);
        assert_eq!(stage.plan(1, ResumeMode::Resume).unwrap(), 0);
        assert!(stage.run(1, ResumeMode::Resume).await.unwrap().skipped);

        runtime.present.store(false, Ordering::SeqCst);
        assert_eq!(stage.run(1, ResumeMode::Resume).await.unwrap().appended, 1);
        assert_eq!(Ledger::<EnvironmentRecord>::open(ctx.paths.environment()).unwrap().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_synthesis_requires_environment() {
        let dir = TempDir::new().unwrap();
        let worker = FnWorker::new(|req: SynthesisRequest| async move { Ok::<_, WorkerError>(candidate(&req.task_id.to_string())) });
        let stage = SynthesisStage::new(context(&dir), Arc::new(worker), Vec::new(), Duration::from_secs(5)).unwrap();

        let err = stage.run(2, ResumeMode::Resume).await.unwrap_err();
        assert!(matches!(err, PipelineError::PreconditionMissing { ref stage, .. } if stage == SYNTHESIS));
    }

    #[tokio::test]
    async fn test_synthesis_stamps_assigned_identity() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        seed_environment(&ctx);
        let worker = FnWorker::new(|_req: SynthesisRequest| async move {
            let mut task = candidate("elsewhere/41");
            task.repo = "/tmp/other".to_string();
            Ok::<_, WorkerError>(task)
        });
        let stage = SynthesisStage::new(ctx.clone(), Arc::new(worker), Vec::new(), Duration::from_secs(5)).unwrap();

        let report = stage.run(2, ResumeMode::Resume).await.unwrap();
        assert_eq!(report.appended, 2);
        let stored = Ledger::<CandidateTask>::open(ctx.paths.tasks()).unwrap().read_all().unwrap();
        let ids: Vec<String> = stored.iter().map(|c| c.task_id.to_string()).collect();
        assert_eq!(ids, vec!["scheme/0", "scheme/1"]);
        assert!(stored.iter().all(|c| c.repo == "/data/scheme"));
    }

    #[tokio::test]
    async fn test_validation_rejects_renamed_task() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        seed_environment(&ctx);
        let tasks = Ledger::open(ctx.paths.tasks()).unwrap();
        tasks.append(&candidate("scheme/0")).unwrap();
        tasks.append(&candidate("scheme/1")).unwrap();

        let worker = FnWorker::new(|req: ValidationRequest| async move {
            let task_id = if req.candidate.task_id.index() == 1 {
                "scheme/7".parse().unwrap()
            } else {
                req.candidate.task_id
            };
            Ok::<_, WorkerError>(ValidatedTask {
                task_id,
                repo: req.candidate.repo,
                commit_message: req.candidate.subject,
                container: req.container,
                log: String::new(),
                tips: String::new(),
                src_diff: "diff --git a/eval.scm b/eval.scm".to_string(),
                tests_diff: "diff --git a/test.scm b/test.scm".to_string(),
            })
        });
        let stage = ValidationStage::new(ctx.clone(), Arc::new(worker), StageRunner::new(2, Duration::from_secs(5))).unwrap();

        assert_eq!(stage.plan(2, ResumeMode::Resume).unwrap(), 2);
        let report = stage.run(2, ResumeMode::Resume).await.unwrap();
        assert_eq!((report.appended, report.failed), (1, 1));
        assert_eq!(stage.plan(2, ResumeMode::Resume).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_missing_diff() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        seed_environment(&ctx);
        Ledger::open(ctx.paths.tasks()).unwrap().append(&candidate("scheme/0")).unwrap();

        let worker = FnWorker::new(|req: ValidationRequest| async move {
            Ok::<_, WorkerError>(ValidatedTask {
                task_id: req.candidate.task_id,
                repo: req.candidate.repo,
                commit_message: String::new(),
                container: req.container,
                log: String::new(),
                tips: String::new(),
                src_diff: "diff --git a/eval.scm b/eval.scm".to_string(),
                tests_diff: "  ".to_string(),
            })
        });
        let stage = ValidationStage::new(ctx, Arc::new(worker), StageRunner::sequential(Duration::from_secs(5))).unwrap();
        let report = stage.run(1, ResumeMode::Resume).await.unwrap();
        assert_eq!((report.appended, report.failed), (0, 1));
    }
}
