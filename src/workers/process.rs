//! Child process helpers shared by command-backed workers, the container
//! runtime and the check sandbox.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::WorkerError;

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `program args..` to completion, feeding `stdin` if given.
///
/// With a `timeout`, the child is killed once it expires and
/// `WorkerError::Timeout` is returned. Without one, the caller's own timeout
/// (dropping this future) kills the child.
pub async fn run_process(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(String, String)],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, WorkerError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_vec();
        // Written from a separate task so a child that never drains stdin
        // cannot block collection of its output.
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!(error = %e, "Child closed stdin early");
            }
        });
    }

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| WorkerError::Timeout {
                seconds: limit.as_secs(),
            })??,
        None => child.wait_with_output().await?,
    };

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Runs a shell snippet through `bash -lc`.
pub async fn run_shell(
    command: &str,
    cwd: Option<&Path>,
    envs: &[(String, String)],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, WorkerError> {
    run_process("bash", &["-lc", command], cwd, envs, stdin, timeout).await
}

/// Cuts `s` to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

/// Keeps the last `max` bytes of `s`, where test runners print their summary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut start = s.len() - max;
        while !s.is_char_boundary(start) && start < s.len() {
            start += 1;
        }
        format!("[truncated] ...{}", &s[start..])
    }
}
