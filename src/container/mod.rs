//! Container boundary.
//!
//! The environment stage asks an [`EnvironmentBuilder`] to produce a container
//! image for a repository snapshot and records its identity. Later stages
//! only ever ask a [`ContainerRuntime`] whether that image still exists.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::repo::repo_label;
use crate::task::EnvironmentRecord;
use crate::workers::process::{run_process, run_shell, truncate};

const BUILD_LOG_LIMIT: usize = 64 * 1024;

/// `env_agent__<label>` with the label lowercased and `#` replaced by `__`.
pub fn standard_container_name(path: &Path) -> String {
    format!(
        "env_agent__{}",
        repo_label(path).to_lowercase().replace('#', "__")
    )
}

/// Queries about images known to the local container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, name: &str) -> Result<bool, WorkerError>;

    /// Content digest of the image, if the runtime reports one.
    async fn image_digest(&self, name: &str) -> Result<Option<String>, WorkerError>;
}

/// `podman` (or any CLI-compatible runtime binary).
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn image_exists(&self, name: &str) -> Result<bool, WorkerError> {
        let out = run_process(&self.binary, &["image", "exists", name], None, &[], None, None).await?;
        Ok(out.success())
    }

    async fn image_digest(&self, name: &str) -> Result<Option<String>, WorkerError> {
        let out = run_process(
            &self.binary,
            &["image", "inspect", "--format", "{{.Id}}", name],
            None,
            &[],
            None,
            None,
        )
        .await?;
        if !out.success() {
            return Ok(None);
        }
        let id = out.stdout.trim();
        Ok((!id.is_empty()).then(|| format!("sha256:{}", id.trim_start_matches("sha256:"))))
    }
}

/// Builds the container environment for one repository snapshot.
#[async_trait]
pub trait EnvironmentBuilder: Send + Sync {
    async fn build(&self, request: &EnvironmentRequest) -> Result<EnvironmentRecord, WorkerError>;
}

/// What the environment command receives on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub repo: String,
    pub commit_sha: String,
    pub worktree: String,
    pub container: String,
}

/// What the environment command may print as its final JSON line.
#[derive(Debug, Clone, Default, Deserialize)]
struct EnvironmentReply {
    #[serde(default)]
    build_script: Option<String>,
    #[serde(default)]
    build_log: Option<String>,
    #[serde(default)]
    tips: Option<String>,
}

/// Runs an external environment agent, then confirms the image it built.
pub struct CommandEnvironmentBuilder {
    command: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl CommandEnvironmentBuilder {
    pub fn new(command: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            command: command.into(),
            runtime,
        }
    }
}

/// Fallback artifact hash when the runtime reports no digest.
pub fn script_fingerprint(build_script: &str, commit_sha: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(commit_sha.as_bytes());
    hasher.update(b"\n");
    hasher.update(build_script.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[async_trait]
impl EnvironmentBuilder for CommandEnvironmentBuilder {
    async fn build(&self, request: &EnvironmentRequest) -> Result<EnvironmentRecord, WorkerError> {
        let container = request.container.as_str();
        let mut input = serde_json::to_vec(request)
            .map_err(|e| WorkerError::BadOutput(format!("cannot encode request: {e}")))?;
        input.push(b'\n');

        info!(container = container, "Building container environment");
        let envs = vec![("BENCH_FORGE_CONTAINER".to_string(), container.to_string())];
        let out = run_shell(
            &self.command,
            Some(Path::new(&request.worktree)),
            &envs,
            Some(&input),
            None,
        )
        .await?;
        if !out.success() {
            return Err(WorkerError::Failed(format!(
                "environment command exited with code {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 2000)
            )));
        }

        let reply: EnvironmentReply = crate::workers::last_json_object(&out.stdout)
            .map(serde_json::from_value::<EnvironmentReply>)
            .transpose()
            .map_err(|e| WorkerError::BadOutput(format!("invalid environment reply: {e}")))?
            .unwrap_or_default();

        if !self.runtime.image_exists(container).await? {
            return Err(WorkerError::Failed(format!(
                "environment command succeeded but image '{container}' does not exist"
            )));
        }

        let build_script = reply.build_script.unwrap_or_default();
        let artifact_hash = match self.runtime.image_digest(container).await? {
            Some(digest) => digest,
            None => {
                warn!(container = container, "Runtime reported no image digest, hashing build script");
                script_fingerprint(&build_script, &request.commit_sha)
            }
        };
        let build_log = reply
            .build_log
            .unwrap_or_else(|| format!("{}{}", out.stdout, out.stderr));

        Ok(EnvironmentRecord {
            repo: request.repo.clone(),
            commit_sha: request.commit_sha.clone(),
            container: request.container.clone(),
            artifact_hash,
            build_script,
            build_log: truncate(&build_log, BUILD_LOG_LIMIT),
            tips: reply.tips.unwrap_or_default(),
            built_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_container_name() {
        assert_eq!(
            standard_container_name(Path::new("/data/Owner#Repo.tar")),
            "env_agent__owner__repo"
        );
        assert_eq!(
            standard_container_name(Path::new("/data/scheme.tar.gz")),
            "env_agent__scheme"
        );
        assert_eq!(
            standard_container_name(Path::new("/work/Toy-Lisp")),
            "env_agent__toy-lisp"
        );
    }

    #[test]
    fn test_script_fingerprint_is_stable() {
        let a = script_fingerprint("FROM python:3.12\n", "abc");
        let b = script_fingerprint("FROM python:3.12\n", "abc");
        let c = script_fingerprint("FROM python:3.12\n", "def");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[tokio::test]
    async fn test_podman_runtime_missing_binary_is_spawn_error() {
        let runtime = PodmanRuntime::new("definitely-not-a-container-runtime");
        let err = runtime.image_exists("env_agent__x").await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
    }
}
