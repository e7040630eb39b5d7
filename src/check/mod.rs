//! Deterministic, agent-free verification of validated tasks.
//!
//! A validated task is accepted when its two diffs behave as advertised:
//!
//! 1. with `src.diff` applied (feature and its tests removed) the suite passes;
//! 2. adding `tests.diff` on top makes the suite fail;
//! 3. reversing `src.diff` instead (feature and tests restored) passes again.
//!
//! Problems with the task itself (missing or non-applying diffs, wrong test
//! outcomes) produce a `fail` verdict. Problems with the machinery (git or the
//! container runtime unavailable) are worker errors, so the task stays
//! pending and is checked again on the next run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::container::{ContainerRuntime, PodmanRuntime};
use crate::error::WorkerError;
use crate::repo::RepoSnapshot;
use crate::task::{CheckResult, ValidatedTask};
use crate::workers::process::{run_process, tail};
use crate::workers::Worker;

const PREVIEW_BYTES: usize = 2000;
const MAX_TEST_OUTPUT: usize = 1024 * 1024;

/// Result of one test-suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl TestRun {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Whether `git apply` accepted a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Rejected(String),
}

/// A scratch copy of the repository the protocol can mutate.
#[async_trait]
pub trait Sandbox: Send {
    async fn apply(&mut self, diff: &str) -> Result<PatchOutcome, WorkerError>;

    async fn reverse(&mut self, diff: &str) -> Result<PatchOutcome, WorkerError>;

    /// Records the current tree as the state `reset` returns to.
    async fn commit_snapshot(&mut self) -> Result<(), WorkerError>;

    async fn reset(&mut self) -> Result<(), WorkerError>;

    async fn run_tests(&mut self) -> Result<TestRun, WorkerError>;
}

/// Creates a fresh sandbox for each task.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn prepare(&self, task: &ValidatedTask) -> Result<Box<dyn Sandbox>, WorkerError>;
}

fn failed(task: &ValidatedTask, detail: String, run: Option<&TestRun>) -> CheckResult {
    let mut result = CheckResult::fail(task.task_id.clone(), detail);
    if let Some(run) = run {
        attach_run(&mut result, run);
    }
    result
}

fn attach_run(result: &mut CheckResult, run: &TestRun) {
    result.exit_code = Some(run.exit_code);
    result.timed_out = run.timed_out;
    result.stdout_preview = tail(&run.stdout, PREVIEW_BYTES);
    result.stderr_preview = tail(&run.stderr, PREVIEW_BYTES);
}

/// Runs the three-step protocol against `sandbox`.
pub async fn verify(task: &ValidatedTask, sandbox: &mut dyn Sandbox) -> Result<CheckResult, WorkerError> {
    for (field, value) in [
        ("container", &task.container),
        ("src.diff", &task.src_diff),
        ("tests.diff", &task.tests_diff),
    ] {
        if value.trim().is_empty() {
            return Ok(failed(task, format!("missing '{field}' field"), None));
        }
    }

    // 1. Feature removed, its tests removed: everything else must still pass.
    if let PatchOutcome::Rejected(err) = sandbox.apply(&task.src_diff).await? {
        return Ok(failed(task, format!("src.diff does not apply: {}", err.trim()), None));
    }
    sandbox.commit_snapshot().await?;
    let run = sandbox.run_tests().await?;
    if !run.passed() {
        return Ok(failed(
            task,
            format!(
                "tests fail with the feature removed (exit_code={}, timed_out={})",
                run.exit_code, run.timed_out
            ),
            Some(&run),
        ));
    }

    // 2. Adding the feature's tests back must make the suite fail.
    sandbox.reset().await?;
    if let PatchOutcome::Rejected(err) = sandbox.apply(&task.tests_diff).await? {
        return Ok(failed(task, format!("tests.diff does not apply: {}", err.trim()), None));
    }
    let run = sandbox.run_tests().await?;
    if run.exit_code == 0 && !run.timed_out {
        return Ok(failed(
            task,
            "tests pass although the feature is removed".to_string(),
            Some(&run),
        ));
    }

    // 3. Restoring the feature and its tests must pass again.
    sandbox.reset().await?;
    if let PatchOutcome::Rejected(err) = sandbox.reverse(&task.src_diff).await? {
        return Ok(failed(task, format!("src.diff does not reverse: {}", err.trim()), None));
    }
    let run = sandbox.run_tests().await?;
    if !run.passed() {
        return Ok(failed(
            task,
            format!(
                "tests fail with the feature restored (exit_code={}, timed_out={})",
                run.exit_code, run.timed_out
            ),
            Some(&run),
        ));
    }

    let mut result = CheckResult::pass(task.task_id.clone(), "all checks passed");
    attach_run(&mut result, &run);
    Ok(result)
}

/// Check worker that runs [`verify`] in a freshly prepared sandbox.
pub struct ProtocolCheckWorker {
    provider: Arc<dyn SandboxProvider>,
}

impl ProtocolCheckWorker {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Worker<ValidatedTask, CheckResult> for ProtocolCheckWorker {
    async fn invoke(&self, task: ValidatedTask) -> Result<CheckResult, WorkerError> {
        let mut sandbox = self.provider.prepare(&task).await?;
        let result = verify(&task, sandbox.as_mut()).await?;
        info!(task_id = %task.task_id, verdict = %result.verdict, detail = %result.detail, "Checked task");
        Ok(result)
    }
}

/// Sandboxes backed by a git clone and `podman run`.
#[derive(Debug, Clone)]
pub struct GitPodmanProvider {
    runtime: PodmanRuntime,
    test_timeout: Duration,
}

impl GitPodmanProvider {
    pub fn new(runtime: PodmanRuntime, test_timeout: Duration) -> Self {
        Self {
            runtime,
            test_timeout,
        }
    }
}

#[async_trait]
impl SandboxProvider for GitPodmanProvider {
    async fn prepare(&self, task: &ValidatedTask) -> Result<Box<dyn Sandbox>, WorkerError> {
        if !self.runtime.image_exists(&task.container).await? {
            return Err(WorkerError::Failed(format!(
                "container image '{}' does not exist",
                task.container
            )));
        }
        let snapshot = RepoSnapshot::open(Path::new(&task.repo))
            .await
            .map_err(|e| WorkerError::Failed(e.to_string()))?;

        let scratch = TempDir::new()?;
        let dir = scratch.path().join("repo");
        let source = snapshot.worktree().to_string_lossy().to_string();
        let target = dir.to_string_lossy().to_string();
        git(None, &["clone", "--quiet", &source, &target], None).await?;
        debug!(task_id = %task.task_id, dir = %dir.display(), "Prepared check sandbox");

        Ok(Box::new(GitPodmanSandbox {
            _scratch: scratch,
            dir,
            container: task.container.clone(),
            runtime: self.runtime.binary().to_string(),
            test_timeout: self.test_timeout,
            snapshot: None,
        }))
    }
}

/// A private clone of the task's repository.
pub struct GitPodmanSandbox {
    _scratch: TempDir,
    dir: PathBuf,
    container: String,
    runtime: String,
    test_timeout: Duration,
    snapshot: Option<String>,
}

async fn git(cwd: Option<&Path>, args: &[&str], stdin: Option<&[u8]>) -> Result<String, WorkerError> {
    let out = run_process("git", args, cwd, &[], stdin, None).await?;
    if !out.success() {
        return Err(WorkerError::Failed(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

impl GitPodmanSandbox {
    async fn git_apply(&self, diff: &str, reverse: bool) -> Result<PatchOutcome, WorkerError> {
        if diff.is_empty() {
            return Ok(PatchOutcome::Applied);
        }
        let args: &[&str] = if reverse {
            &["apply", "--reverse"]
        } else {
            &["apply"]
        };
        let out = run_process("git", args, Some(&self.dir), &[], Some(diff.as_bytes()), None).await?;
        if out.success() {
            Ok(PatchOutcome::Applied)
        } else {
            Ok(PatchOutcome::Rejected(out.stderr))
        }
    }
}

#[async_trait]
impl Sandbox for GitPodmanSandbox {
    async fn apply(&mut self, diff: &str) -> Result<PatchOutcome, WorkerError> {
        self.git_apply(diff, false).await
    }

    async fn reverse(&mut self, diff: &str) -> Result<PatchOutcome, WorkerError> {
        self.git_apply(diff, true).await
    }

    async fn commit_snapshot(&mut self) -> Result<(), WorkerError> {
        git(Some(&self.dir), &["add", "-A"], None).await?;
        git(
            Some(&self.dir),
            &[
                "-c",
                "user.name=bench-forge",
                "-c",
                "user.email=bench-forge@localhost",
                "commit",
                "--quiet",
                "--allow-empty",
                "--no-verify",
                "-m",
                "Final state: feature removed",
            ],
            None,
        )
        .await?;
        let head = git(Some(&self.dir), &["rev-parse", "HEAD"], None).await?;
        self.snapshot = Some(head.trim().to_string());
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), WorkerError> {
        let rev = self.snapshot.clone().unwrap_or_else(|| "HEAD".to_string());
        git(Some(&self.dir), &["reset", "--hard", "--quiet", &rev], None).await?;
        git(Some(&self.dir), &["clean", "-fdq"], None).await?;
        Ok(())
    }

    async fn run_tests(&mut self) -> Result<TestRun, WorkerError> {
        let mount = format!("{}:/repo:rw", self.dir.display());
        let args = [
            "run",
            "--rm",
            "--network",
            "none",
            "-v",
            mount.as_str(),
            self.container.as_str(),
        ];
        match run_process(&self.runtime, &args, None, &[], None, Some(self.test_timeout)).await {
            Ok(out) => Ok(TestRun {
                exit_code: out.exit_code,
                stdout: tail(&out.stdout, MAX_TEST_OUTPUT),
                stderr: tail(&out.stderr, MAX_TEST_OUTPUT),
                timed_out: false,
            }),
            Err(WorkerError::Timeout { seconds }) => Ok(TestRun {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {seconds}s"),
                timed_out: true,
            }),
            Err(e) => Err(e),
        }
    }
}
