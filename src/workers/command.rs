//! Worker backed by an external shell command.
//!
//! The item is written to the command's stdin as a single JSON line. The
//! command may print progress freely; the result is the LAST line of stdout
//! that parses as a JSON object.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::process::{run_shell, truncate};
use super::Worker;
use crate::error::WorkerError;

const STDERR_PREVIEW_BYTES: usize = 2000;

/// Runs `bash -lc <command>` once per item.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    name: String,
    command: String,
    workdir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl CommandWorker {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: None,
            envs: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Last line of `stdout` that is a JSON object.
pub(crate) fn last_json_object(stdout: &str) -> Option<serde_json::Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .filter(serde_json::Value::is_object)
        })
}

#[async_trait]
impl<I, O> Worker<I, O> for CommandWorker
where
    I: Serialize + Send + Sync + 'static,
    O: DeserializeOwned + Send + 'static,
{
    async fn invoke(&self, item: I) -> Result<O, WorkerError> {
        let mut input = serde_json::to_vec(&item)
            .map_err(|e| WorkerError::BadOutput(format!("cannot encode worker input: {e}")))?;
        input.push(b'\n');

        debug!(worker = %self.name, command = %self.command, "Invoking command worker");
        let output = run_shell(
            &self.command,
            self.workdir.as_deref(),
            &self.envs,
            Some(&input),
            None,
        )
        .await?;

        if !output.success() {
            return Err(WorkerError::Failed(format!(
                "{} exited with code {}: {}",
                self.name,
                output.exit_code,
                truncate(output.stderr.trim(), STDERR_PREVIEW_BYTES)
            )));
        }

        let value = last_json_object(&output.stdout).ok_or_else(|| {
            WorkerError::BadOutput(format!(
                "{} printed no JSON object on stdout ({} bytes)",
                self.name,
                output.stdout.len()
            ))
        })?;
        serde_json::from_value(value)
            .map_err(|e| WorkerError::BadOutput(format!("{} returned an invalid record: {e}", self.name)))
    }
}
