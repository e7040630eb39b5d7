//! Task identifiers and the records each pipeline stage persists.

mod id;
mod records;

pub use id::{TaskId, TaskIdError};
pub use records::{CandidateTask, CheckResult, EnvironmentRecord, Record, ValidatedTask, Verdict};

/// Records that can be matched across ledgers by their `task_id`.
pub trait Keyed {
    /// The record's task identifier, if it carries one.
    fn task_key(&self) -> Option<String>;
}

impl Keyed for CandidateTask {
    fn task_key(&self) -> Option<String> {
        Some(self.task_id.to_string())
    }
}

impl Keyed for ValidatedTask {
    fn task_key(&self) -> Option<String> {
        Some(self.task_id.to_string())
    }
}

impl Keyed for CheckResult {
    fn task_key(&self) -> Option<String> {
        Some(self.task_id.to_string())
    }
}

impl Keyed for Record {
    fn task_key(&self) -> Option<String> {
        self.get("task_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}
