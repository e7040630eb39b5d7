//! Record types persisted in the pipeline ledgers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::TaskId;

/// A schema-agnostic ledger record: one JSON object.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Built container environment for one repository at one commit.
///
/// Written once per (repo, commit) and never modified; every later stage
/// requires a matching record before it may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub repo: String,
    pub commit_sha: String,
    pub container: String,
    pub artifact_hash: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub build_script: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub build_log: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tips: String,
    pub built_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    pub fn matches(&self, repo: &str, commit_sha: &str) -> bool {
        self.repo == repo && self.commit_sha == commit_sha
    }
}

/// A synthesized feature re-implementation candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTask {
    pub task_id: TaskId,
    pub repo: String,
    pub commit_sha: String,
    pub subject: String,
    pub task_description: String,
    /// SEARCH/REPLACE blocks describing how to remove the feature.
    pub patches: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reasoning: String,
    #[serde(default)]
    pub matching_files: Vec<String>,
}

/// A candidate after an agent confirmed it inside the container.
///
/// Carries the same `task_id` as the candidate it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedTask {
    pub task_id: TaskId,
    pub repo: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub commit_message: String,
    pub container: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub log: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tips: String,
    /// Diff from the original repository to the feature-removed state.
    #[serde(rename = "src.diff")]
    pub src_diff: String,
    /// Diff that adds only the tests targeting the removed feature.
    #[serde(rename = "tests.diff")]
    pub tests_diff: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// Outcome of the agent-free verification of one validated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub task_id: TaskId,
    pub verdict: Verdict,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub stdout_preview: String,
    #[serde(default)]
    pub stderr_preview: String,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn pass(task_id: TaskId, detail: impl Into<String>) -> Self {
        Self::new(task_id, Verdict::Pass, detail)
    }

    pub fn fail(task_id: TaskId, detail: impl Into<String>) -> Self {
        Self::new(task_id, Verdict::Fail, detail)
    }

    fn new(task_id: TaskId, verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            task_id,
            verdict,
            detail: detail.into(),
            exit_code: None,
            timed_out: false,
            stdout_preview: String::new(),
            stderr_preview: String::new(),
            checked_at: Utc::now(),
        }
    }
}

/// Agents often emit `null` for artifacts they never produced.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
