//! Layout of a pipeline state directory.
//!
//! A state directory doubles as a dataset directory: the three task ledgers
//! use the same file names the dataset loader and merger expect.

use std::path::{Path, PathBuf};

use crate::repo::repo_label;

pub const ENVIRONMENT_FILE: &str = "environment.jsonl";
pub const TASKS_FILE: &str = "tasks.jsonl";
pub const VALIDATED_FILE: &str = "validated_tasks.jsonl";
pub const CHECKS_FILE: &str = "check_results.jsonl";
pub const WORKFLOW_LOG_FILE: &str = "workflow.log";

/// Paths of every file the pipeline keeps under one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment(&self) -> PathBuf {
        self.root.join(ENVIRONMENT_FILE)
    }

    pub fn tasks(&self) -> PathBuf {
        self.root.join(TASKS_FILE)
    }

    pub fn validated(&self) -> PathBuf {
        self.root.join(VALIDATED_FILE)
    }

    pub fn checks(&self) -> PathBuf {
        self.root.join(CHECKS_FILE)
    }

    pub fn workflow_log(&self) -> PathBuf {
        self.root.join(WORKFLOW_LOG_FILE)
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

/// `workflow_state/<label>` for a repository directory or tarball.
pub fn default_state_dir(repo: &Path) -> PathBuf {
    Path::new("workflow_state").join(repo_label(repo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_paths_layout() {
        let paths = StatePaths::new("/state/scheme");
        assert_eq!(paths.tasks(), PathBuf::from("/state/scheme/tasks.jsonl"));
        assert_eq!(
            paths.validated(),
            PathBuf::from("/state/scheme/validated_tasks.jsonl")
        );
        assert_eq!(
            paths.checks(),
            PathBuf::from("/state/scheme/check_results.jsonl")
        );
        assert_eq!(
            paths.environment(),
            PathBuf::from("/state/scheme/environment.jsonl")
        );
        assert_eq!(
            paths.workflow_log(),
            PathBuf::from("/state/scheme/workflow.log")
        );
    }

    #[test]
    fn test_default_state_dir_uses_label() {
        assert_eq!(
            default_state_dir(Path::new("/data/scheme.tar.gz")),
            PathBuf::from("workflow_state/scheme")
        );
        assert_eq!(
            default_state_dir(Path::new("/data/toy-lisp/")),
            PathBuf::from("workflow_state/toy-lisp")
        );
    }
}
