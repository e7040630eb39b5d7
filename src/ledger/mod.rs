//! Append-only record storage and the state directory layout.

mod jsonl;
mod paths;

pub use jsonl::Ledger;
pub use paths::{
    default_state_dir, StatePaths, CHECKS_FILE, ENVIRONMENT_FILE, TASKS_FILE, VALIDATED_FILE,
    WORKFLOW_LOG_FILE,
};
