//! Pipeline configuration.
//!
//! This module provides configuration for a workflow run: where the ledgers
//! live, how many candidates to produce, how wide the parallel stages fan
//! out, per-item timeouts, and the external commands that stand in for the
//! coding agents.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ledger::default_state_dir;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable (or its flag) is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for one workflow run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // State settings
    /// Directory holding the ledgers; `None` derives `workflow_state/<label>`.
    pub state_dir: Option<PathBuf>,
    /// Number of candidate tasks the synthesis stage should reach.
    pub target_candidates: usize,
    /// Plan every stage as if its ledger were empty.
    pub force_fresh: bool,

    // Execution settings
    /// Parallel validation workers.
    pub validation_workers: usize,
    /// Parallel check workers.
    pub check_workers: usize,
    /// Timeout for one agent call (environment, synthesis, validation).
    pub step_timeout: Duration,
    /// Timeout for one test-suite run inside the container.
    pub check_timeout: Duration,

    // External collaborators
    /// Shell command that synthesizes one candidate.
    pub synth_command: Option<String>,
    /// Shell command that validates one candidate.
    pub validate_command: Option<String>,
    /// Shell command that builds the container environment.
    pub env_command: Option<String>,
    /// Shell command that checks one validated task (defaults to the built-in protocol).
    pub check_command: Option<String>,
    /// Container name override; derived from the repository label when unset.
    pub container: Option<String>,
    /// Container runtime binary.
    pub container_runtime: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            target_candidates: 3,
            force_fresh: false,

            validation_workers: 4,
            check_workers: 4,
            step_timeout: Duration::from_secs(3600), // 1 hour
            check_timeout: Duration::from_secs(300), // 5 minutes

            synth_command: None,
            validate_command: None,
            env_command: None,
            check_command: None,
            container: None,
            container_runtime: "podman".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BENCH_FORGE_STATE_DIR`: Ledger directory (default: `workflow_state/<label>`)
    /// - `BENCH_FORGE_NUM_CANDIDATES`: Candidate target (default: 3)
    /// - `BENCH_FORGE_FORCE_FRESH`: Ignore existing ledger counts (default: false)
    /// - `BENCH_FORGE_VALIDATION_WORKERS`: Parallel validation workers (default: 4)
    /// - `BENCH_FORGE_CHECK_WORKERS`: Parallel check workers (default: 4)
    /// - `BENCH_FORGE_STEP_TIMEOUT_SECS`: Agent call timeout (default: 3600)
    /// - `BENCH_FORGE_CHECK_TIMEOUT_SECS`: Test run timeout (default: 300)
    /// - `BENCH_FORGE_SYNTH_COMMAND`, `BENCH_FORGE_VALIDATE_COMMAND`,
    ///   `BENCH_FORGE_ENV_COMMAND`, `BENCH_FORGE_CHECK_COMMAND`: worker commands
    /// - `BENCH_FORGE_CONTAINER`: Container name override
    /// - `BENCH_FORGE_CONTAINER_RUNTIME`: Runtime binary (default: podman)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BENCH_FORGE_STATE_DIR") {
            config.state_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_NUM_CANDIDATES") {
            config.target_candidates = parse_env_value(&val, "BENCH_FORGE_NUM_CANDIDATES")?;
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_FORCE_FRESH") {
            config.force_fresh = parse_env_bool(&val, "BENCH_FORGE_FORCE_FRESH")?;
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_VALIDATION_WORKERS") {
            config.validation_workers = parse_env_value(&val, "BENCH_FORGE_VALIDATION_WORKERS")?;
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_CHECK_WORKERS") {
            config.check_workers = parse_env_value(&val, "BENCH_FORGE_CHECK_WORKERS")?;
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_STEP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BENCH_FORGE_STEP_TIMEOUT_SECS")?;
            config.step_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("BENCH_FORGE_CHECK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BENCH_FORGE_CHECK_TIMEOUT_SECS")?;
            config.check_timeout = Duration::from_secs(secs);
        }

        config.synth_command = non_empty_env("BENCH_FORGE_SYNTH_COMMAND");
        config.validate_command = non_empty_env("BENCH_FORGE_VALIDATE_COMMAND");
        config.env_command = non_empty_env("BENCH_FORGE_ENV_COMMAND");
        config.check_command = non_empty_env("BENCH_FORGE_CHECK_COMMAND");
        config.container = non_empty_env("BENCH_FORGE_CONTAINER");

        if let Ok(val) = std::env::var("BENCH_FORGE_CONTAINER_RUNTIME") {
            config.container_runtime = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "validation_workers must be greater than 0".to_string(),
            ));
        }

        if self.check_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "check_workers must be greater than 0".to_string(),
            ));
        }

        if self.step_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "step_timeout must be greater than 0".to_string(),
            ));
        }

        if self.check_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "check_timeout must be greater than 0".to_string(),
            ));
        }

        if self.container_runtime.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "container_runtime cannot be empty".to_string(),
            ));
        }

        if let Some(container) = &self.container {
            if container.trim().is_empty() || container.contains(char::is_whitespace) {
                return Err(ConfigError::ValidationFailed(format!(
                    "container name '{}' must be non-empty and contain no whitespace",
                    container
                )));
            }
        }

        Ok(())
    }

    /// State directory for `repo`: the configured one or `workflow_state/<label>`.
    pub fn resolve_state_dir(&self, repo: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| default_state_dir(repo))
    }

    /// Returns a configured worker command or the variable that would set it.
    pub fn require_command<'a>(
        command: &'a Option<String>,
        env_key: &str,
    ) -> Result<&'a str, ConfigError> {
        command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar(env_key.to_string()))
    }

    /// Builder method to set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Builder method to set the candidate target.
    pub fn with_target_candidates(mut self, target: usize) -> Self {
        self.target_candidates = target;
        self
    }

    /// Builder method to enable or disable force-fresh planning.
    pub fn with_force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }

    /// Builder method to set parallel validation workers.
    pub fn with_validation_workers(mut self, workers: usize) -> Self {
        self.validation_workers = workers;
        self
    }

    /// Builder method to set parallel check workers.
    pub fn with_check_workers(mut self, workers: usize) -> Self {
        self.check_workers = workers;
        self
    }

    /// Builder method to set the agent call timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Builder method to set the test run timeout.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_synth_command(mut self, command: impl Into<String>) -> Self {
        self.synth_command = Some(command.into());
        self
    }

    pub fn with_validate_command(mut self, command: impl Into<String>) -> Self {
        self.validate_command = Some(command.into());
        self
    }

    pub fn with_env_command(mut self, command: impl Into<String>) -> Self {
        self.env_command = Some(command.into());
        self
    }

    pub fn with_check_command(mut self, command: impl Into<String>) -> Self {
        self.check_command = Some(command.into());
        self
    }

    /// Builder method to override the container name.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
