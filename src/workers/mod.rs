//! The worker boundary.
//!
//! Every external call a stage makes (a coding agent synthesizing or
//! validating a task, or a checker running a test suite) goes through the
//! [`Worker`] trait, so stages can be driven by real processes or by
//! deterministic stubs in tests.

mod command;
mod func;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::task::{CandidateTask, TaskId};

pub use command::CommandWorker;
pub(crate) use command::last_json_object;
pub use func::FnWorker;

/// One external call per work item.
///
/// An error only affects that item; the stage runner logs it and moves on.
#[async_trait]
pub trait Worker<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn invoke(&self, item: I) -> Result<O, WorkerError>;
}

/// Input to the synthesis agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Identifier the produced candidate must carry.
    pub task_id: TaskId,
    pub repo: String,
    pub commit_sha: String,
    /// Checked-out working tree the agent may read.
    pub worktree: String,
    pub container: String,
    pub matching_files: Vec<String>,
    /// Subjects of candidates already synthesized, to avoid repeats.
    pub avoid_subjects: Vec<String>,
}

/// Input to the validation agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub candidate: CandidateTask,
    pub container: String,
    pub worktree: String,
}
