//! Resume behaviour of the full workflow, driven by deterministic stub workers.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bench_forge::container::{ContainerRuntime, EnvironmentBuilder, EnvironmentRequest};
use bench_forge::ledger::{Ledger, StatePaths};
use bench_forge::pipeline::{PipelineConfig, StageContext, Workflow, WorkflowWorkers};
use bench_forge::task::{CandidateTask, CheckResult, EnvironmentRecord, ValidatedTask};
use bench_forge::workers::{FnWorker, SynthesisRequest, ValidationRequest, Worker};
use bench_forge::{PipelineError, WorkerError};
use chrono::Utc;
use tempfile::TempDir;

struct StubRuntime;

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn image_exists(&self, _name: &str) -> Result<bool, WorkerError> {
        Ok(true)
    }

    async fn image_digest(&self, _name: &str) -> Result<Option<String>, WorkerError> {
        Ok(None)
    }
}

struct StubBuilder {
    builds: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl EnvironmentBuilder for StubBuilder {
    async fn build(&self, request: &EnvironmentRequest) -> Result<EnvironmentRecord, WorkerError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(WorkerError::Failed("image build exited with code 1".to_string()));
        }
        Ok(EnvironmentRecord {
            repo: request.repo.clone(),
            commit_sha: request.commit_sha.clone(),
            container: request.container.clone(),
            artifact_hash: "sha256:feedface".to_string(),
            build_script: "FROM python:3.12".to_string(),
            build_log: String::new(),
            tips: String::new(),
            built_at: Utc::now(),
        })
    }
}

/// Call counters and failure switches shared with the stub workers.
#[derive(Default, Clone)]
struct Stubs {
    builds: Arc<AtomicUsize>,
    synth_calls: Arc<AtomicUsize>,
    validate_calls: Arc<AtomicUsize>,
    check_calls: Arc<AtomicUsize>,
    avoid_sizes: Arc<Mutex<Vec<usize>>>,
    failing_validation: Arc<Mutex<HashSet<String>>>,
    failing_checks: Arc<Mutex<HashSet<String>>>,
    fail_build: bool,
}

impl Stubs {
    fn workers(&self) -> WorkflowWorkers {
        let synth_calls = self.synth_calls.clone();
        let avoid_sizes = self.avoid_sizes.clone();
        let synthesis: Arc<dyn Worker<SynthesisRequest, CandidateTask>> =
            Arc::new(FnWorker::new(move |req: SynthesisRequest| {
                synth_calls.fetch_add(1, Ordering::SeqCst);
                avoid_sizes.lock().unwrap().push(req.avoid_subjects.len());
                async move {
                    Ok::<_, WorkerError>(CandidateTask {
                        subject: format!("feature {}", req.task_id.index()),
                        task_id: req.task_id,
                        repo: req.repo,
                        commit_sha: req.commit_sha,
                        task_description: "Re-implement the removed feature".to_string(),
                        patches: "<<<<<<< SEARCH\n=======\n>>>>>>> REPLACE".to_string(),
                        reasoning: String::new(),
                        matching_files: req.matching_files,
                    })
                }
            }));

        let validate_calls = self.validate_calls.clone();
        let failing_validation = self.failing_validation.clone();
        let validation: Arc<dyn Worker<ValidationRequest, ValidatedTask>> =
            Arc::new(FnWorker::new(move |req: ValidationRequest| {
                validate_calls.fetch_add(1, Ordering::SeqCst);
                let fail = failing_validation
                    .lock()
                    .unwrap()
                    .contains(&req.candidate.task_id.to_string());
                async move {
                    if fail {
                        return Err(WorkerError::Failed("agent gave up".to_string()));
                    }
                    Ok(ValidatedTask {
                        task_id: req.candidate.task_id,
                        repo: req.candidate.repo,
                        commit_message: req.candidate.subject,
                        container: req.container,
                        log: String::new(),
                        tips: String::new(),
                        src_diff: "diff --git a/src.py b/src.py".to_string(),
                        tests_diff: "diff --git a/test_src.py b/test_src.py".to_string(),
                    })
                }
            }));

        let check_calls = self.check_calls.clone();
        let failing_checks = self.failing_checks.clone();
        let check: Arc<dyn Worker<ValidatedTask, CheckResult>> =
            Arc::new(FnWorker::new(move |task: ValidatedTask| {
                check_calls.fetch_add(1, Ordering::SeqCst);
                let fail = failing_checks.lock().unwrap().contains(&task.task_id.to_string());
                async move {
                    Ok::<_, WorkerError>(if fail {
                        CheckResult::fail(task.task_id, "tests still pass without the feature")
                    } else {
                        CheckResult::pass(task.task_id, "all phases passed")
                    })
                }
            }));

        WorkflowWorkers {
            environment: Arc::new(StubBuilder {
                builds: self.builds.clone(),
                fail: self.fail_build,
            }),
            runtime: Arc::new(StubRuntime),
            synthesis,
            validation,
            check,
        }
    }
}

fn context(dir: &Path) -> StageContext {
    StageContext {
        repo: "/data/repoA".to_string(),
        commit_sha: "0123abcd".to_string(),
        worktree: dir.join("worktree"),
        label: "repoA".to_string(),
        container: "env_agent__repoa".to_string(),
        paths: StatePaths::new(dir.join("state")),
    }
}

fn config(target: usize) -> PipelineConfig {
    PipelineConfig::new()
        .with_target_candidates(target)
        .with_validation_workers(3)
        .with_check_workers(2)
}

async fn run(dir: &Path, config: &PipelineConfig, stubs: &Stubs) -> Result<bench_forge::pipeline::WorkflowSummary, PipelineError> {
    Workflow::new(config, context(dir), vec!["src.py".to_string()], stubs.workers())?
        .run()
        .await
}

fn validated_ids(dir: &Path) -> Vec<String> {
    Ledger::<ValidatedTask>::open(StatePaths::new(dir.join("state")).validated())
        .unwrap()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|v| v.task_id.to_string())
        .collect()
}

fn candidate_ids(dir: &Path) -> Vec<String> {
    Ledger::<CandidateTask>::open(StatePaths::new(dir.join("state")).tasks())
        .unwrap()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|c| c.task_id.to_string())
        .collect()
}

#[tokio::test]
async fn test_fresh_run_reaches_target() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();

    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();

    assert_eq!(candidate_ids(dir.path()), vec!["repoA/0", "repoA/1", "repoA/2"]);
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.validated, 3);
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.passed, 3);
    assert!(summary.success());
    assert_eq!(stubs.builds.load(Ordering::SeqCst), 1);
    assert_eq!(*stubs.avoid_sizes.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_rerun_with_target_met_does_no_work() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    run(dir.path(), &config(3), &stubs).await.unwrap();

    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();
    assert!(summary.stages.iter().all(|s| s.skipped));
    assert_eq!(stubs.builds.load(Ordering::SeqCst), 1);
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 3);
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), 3);
    assert_eq!(stubs.check_calls.load(Ordering::SeqCst), 3);

    // A smaller target than what exists is also a pure skip.
    run(dir.path(), &config(1), &stubs).await.unwrap();
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_raised_target_appends_only_the_deficit() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    run(dir.path(), &config(3), &stubs).await.unwrap();

    let summary = run(dir.path(), &config(5), &stubs).await.unwrap();
    assert_eq!(
        candidate_ids(dir.path()),
        vec!["repoA/0", "repoA/1", "repoA/2", "repoA/3", "repoA/4"]
    );
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 5);
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), 5);
    assert_eq!(stubs.check_calls.load(Ordering::SeqCst), 5);
    assert_eq!(summary.validated, 5);
    assert_eq!(*stubs.avoid_sizes.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_worker_failure_stays_pending_until_next_run() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    stubs.failing_validation.lock().unwrap().insert("repoA/1".to_string());

    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();
    assert_eq!(summary.validated, 2);
    assert_eq!(summary.checked, 2);
    let validation = &summary.stages[2];
    assert_eq!((validation.appended, validation.failed), (2, 1));

    stubs.failing_validation.lock().unwrap().clear();
    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();
    assert_eq!(summary.validated, 3);
    // Only the previously failed candidate is retried.
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), 4);
    assert_eq!(stubs.check_calls.load(Ordering::SeqCst), 3);
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_force_fresh_appends_without_deleting() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    run(dir.path(), &config(3), &stubs).await.unwrap();

    let summary = run(dir.path(), &config(2).with_force_fresh(true), &stubs).await.unwrap();
    assert_eq!(
        candidate_ids(dir.path()),
        vec!["repoA/0", "repoA/1", "repoA/2", "repoA/3", "repoA/4"]
    );
    assert_eq!(stubs.builds.load(Ordering::SeqCst), 2);

    // Every candidate was validated and checked again, but the summary counts tasks.
    assert_eq!(validated_ids(dir.path()).len(), 8);
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), 8);
    assert_eq!(stubs.check_calls.load(Ordering::SeqCst), 8);
    assert_eq!(summary.candidates, 5);
    assert_eq!(summary.validated, 5);
    assert_eq!(summary.checked, 5);
    assert_eq!((summary.passed, summary.failed), (5, 0));
    let envs = Ledger::<EnvironmentRecord>::open(StatePaths::new(dir.path().join("state")).environment())
        .unwrap()
        .count()
        .unwrap();
    assert_eq!(envs, 2);
}

#[tokio::test]
async fn test_resume_after_force_fresh_retries_failed_item() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    run(dir.path(), &config(3), &stubs).await.unwrap();

    stubs.failing_validation.lock().unwrap().insert("repoA/4".to_string());
    let summary = run(dir.path(), &config(3).with_force_fresh(true), &stubs).await.unwrap();
    assert_eq!(
        candidate_ids(dir.path()),
        vec!["repoA/0", "repoA/1", "repoA/2", "repoA/3", "repoA/4", "repoA/5"]
    );
    let validation = &summary.stages[2];
    assert_eq!((validation.appended, validation.failed), (5, 1));
    assert_eq!(summary.validated, 5);
    assert!(!validated_ids(dir.path()).contains(&"repoA/4".to_string()));
    let validate_calls = stubs.validate_calls.load(Ordering::SeqCst);
    let check_calls = stubs.check_calls.load(Ordering::SeqCst);

    // The validated ledger now holds more lines than there are candidates;
    // the failed candidate must still be picked up.
    stubs.failing_validation.lock().unwrap().clear();
    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 6);
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), validate_calls + 1);
    assert_eq!(stubs.check_calls.load(Ordering::SeqCst), check_calls + 1);
    let (validation, check) = (&summary.stages[2], &summary.stages[3]);
    assert_eq!((validation.planned, validation.appended, validation.failed), (1, 1, 0));
    assert_eq!((check.planned, check.appended), (1, 1));
    assert_eq!(
        validated_ids(dir.path()).iter().filter(|id| *id == "repoA/4").count(),
        1
    );
    assert_eq!(summary.candidates, 6);
    assert_eq!(summary.validated, 6);
    assert_eq!(summary.checked, 6);
    assert_eq!((summary.passed, summary.failed), (6, 0));

    // Nothing left to do.
    let summary = run(dir.path(), &config(3), &stubs).await.unwrap();
    assert!(summary.stages.iter().all(|s| s.skipped));
    assert_eq!(stubs.validate_calls.load(Ordering::SeqCst), validate_calls + 1);
}

#[tokio::test]
async fn test_failed_environment_blocks_later_stages() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs {
        fail_build: true,
        ..Stubs::default()
    };

    let err = run(dir.path(), &config(3), &stubs).await.unwrap_err();
    assert!(matches!(err, PipelineError::PreconditionMissing { ref stage, .. } if stage == "environment"));
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 0);
    assert!(candidate_ids(dir.path()).is_empty());
}

#[tokio::test]
async fn test_failing_check_makes_run_unsuccessful() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    stubs.failing_checks.lock().unwrap().insert("repoA/0".to_string());

    let summary = run(dir.path(), &config(2), &stubs).await.unwrap();
    assert_eq!((summary.passed, summary.failed), (1, 1));
    assert!(!summary.success());
}

#[tokio::test]
async fn test_zero_target_skips_synthesis() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    let summary = run(dir.path(), &config(0), &stubs).await.unwrap();
    assert_eq!(summary.candidates, 0);
    assert_eq!(stubs.synth_calls.load(Ordering::SeqCst), 0);
    assert!(summary.success());
}

#[tokio::test]
async fn test_all_synthesis_failing_is_no_progress() {
    let dir = TempDir::new().unwrap();
    let stubs = Stubs::default();
    let mut workers = stubs.workers();
    workers.synthesis = Arc::new(FnWorker::new(|_req: SynthesisRequest| async {
        Err::<CandidateTask, _>(WorkerError::BadOutput("no JSON object on stdout".to_string()))
    }));

    let err = Workflow::new(&config(2), context(dir.path()), Vec::new(), workers)
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoProgress { .. }));
}
