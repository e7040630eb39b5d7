//! Repository snapshots.
//!
//! A repository is given either as a git working directory, used in place,
//! or as a tarball holding a single bare git repository. Tarballs are
//! extracted and cloned into a scratch directory that lives as long as the
//! snapshot.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::workers::process::run_process;

const TARBALL_SUFFIXES: [&str; 3] = [".tar.gz", ".tgz", ".tar"];

/// Human-readable repository label: directory name, or tarball file stem.
///
/// `owner#name.tar` → `owner#name`, `scheme.tar.gz` → `scheme`.
pub fn repo_label(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    TARBALL_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .map(str::to_string)
        .unwrap_or(name)
}

fn is_tarball(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .is_some_and(|name| TARBALL_SUFFIXES.iter().any(|s| name.ends_with(s)))
}

/// A checked-out repository the pipeline works against.
#[derive(Debug)]
pub struct RepoSnapshot {
    /// Path the user supplied, canonicalized. This is the repository identity.
    source: PathBuf,
    /// Working tree the agents read.
    worktree: PathBuf,
    label: String,
    commit_sha: String,
    _scratch: Option<TempDir>,
}

impl RepoSnapshot {
    /// Opens a repository directory or extracts a bare-repository tarball.
    pub async fn open(path: &Path) -> Result<Self, PipelineError> {
        let source = path.canonicalize().map_err(|e| {
            PipelineError::Repository(format!("cannot open {}: {e}", path.display()))
        })?;
        let label = repo_label(&source);

        let (worktree, scratch) = if source.is_dir() {
            (source.clone(), None)
        } else if is_tarball(&source) {
            let scratch = TempDir::new().map_err(|e| {
                PipelineError::Repository(format!("cannot create scratch directory: {e}"))
            })?;
            let extract_dir = scratch.path().join("bare");
            let tarball = source.clone();
            let target = extract_dir.clone();
            let bare = tokio::task::spawn_blocking(move || extract_bare_repo(&tarball, &target))
                .await??;

            let worktree = scratch.path().join("worktree");
            git_clone(&bare, &worktree).await?;
            (worktree, Some(scratch))
        } else {
            return Err(PipelineError::Repository(format!(
                "{} is neither a directory nor a .tar/.tar.gz/.tgz file",
                source.display()
            )));
        };

        let commit_sha = git_head(&worktree).await?;
        info!(
            repo = %source.display(),
            worktree = %worktree.display(),
            commit = %commit_sha,
            "Opened repository snapshot"
        );
        Ok(Self {
            source,
            worktree,
            label,
            commit_sha,
            _scratch: scratch,
        })
    }

    /// Repository identity as stored in ledger records.
    pub fn repo(&self) -> String {
        self.source.display().to_string()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commit_sha(&self) -> &str {
        &self.commit_sha
    }
}

/// Extracts `tarball` into `dest` and returns the bare repository inside.
fn extract_bare_repo(tarball: &Path, dest: &Path) -> Result<PathBuf, PipelineError> {
    let repo_err = |msg: String| PipelineError::Repository(msg);
    std::fs::create_dir_all(dest)
        .map_err(|e| repo_err(format!("cannot create {}: {e}", dest.display())))?;

    let file = File::open(tarball)
        .map_err(|e| repo_err(format!("cannot open {}: {e}", tarball.display())))?;
    let reader = BufReader::new(file);
    let name = tarball.to_string_lossy();
    let unpacked = if name.ends_with(".gz") || name.ends_with(".tgz") {
        tar::Archive::new(GzDecoder::new(reader)).unpack(dest)
    } else {
        tar::Archive::new(reader).unpack(dest)
    };
    unpacked.map_err(|e| repo_err(format!("cannot extract {}: {e}", tarball.display())))?;

    let entries: Vec<PathBuf> = std::fs::read_dir(dest)
        .map_err(|e| repo_err(format!("cannot list {}: {e}", dest.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    let [bare] = entries.as_slice() else {
        return Err(repo_err(format!(
            "expected exactly one directory in {}, found {} entries",
            tarball.display(),
            entries.len()
        )));
    };
    if !bare.is_dir() || !bare.join("HEAD").exists() || !bare.join("objects").exists() {
        return Err(repo_err(format!(
            "{} does not contain a bare git repository",
            tarball.display()
        )));
    }
    debug!(bare = %bare.display(), "Extracted bare repository");
    Ok(bare.clone())
}

async fn git_clone(bare: &Path, worktree: &Path) -> Result<(), PipelineError> {
    let bare = bare.to_string_lossy().to_string();
    let target = worktree.to_string_lossy().to_string();
    let out = run_process("git", &["clone", "--quiet", &bare, &target], None, &[], None, None)
        .await
        .map_err(|e| PipelineError::Repository(format!("git clone failed: {e}")))?;
    if !out.success() {
        return Err(PipelineError::Repository(format!(
            "git clone failed: {}",
            out.stderr.trim()
        )));
    }
    Ok(())
}

async fn git_head(worktree: &Path) -> Result<String, PipelineError> {
    let out = run_process("git", &["rev-parse", "HEAD"], Some(worktree), &[], None, None)
        .await
        .map_err(|e| PipelineError::Repository(format!("git rev-parse failed: {e}")))?;
    if !out.success() {
        return Err(PipelineError::Repository(format!(
            "{} is not a git repository with commits: {}",
            worktree.display(),
            out.stderr.trim()
        )));
    }
    Ok(out.stdout.trim().to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, PipelineError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| PipelineError::Repository(format!("invalid pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Repository(format!("invalid pattern set: {e}")))
}

fn normalise(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files under `root` matching any of `patterns`, as sorted relative paths.
///
/// The `.git` directory is never searched. No match at all is an error: the
/// agents would have nothing to work on.
pub fn find_matching_files(root: &Path, patterns: &[String]) -> Result<Vec<String>, PipelineError> {
    if patterns.is_empty() {
        return Err(PipelineError::Repository(
            "at least one file pattern is required".to_string(),
        ));
    }
    let globset = build_globset(patterns)?;

    let mut matches = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Repository(format!("walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = normalise(rel);
        if globset.is_match(&rel) {
            matches.push(rel);
        }
    }
    matches.sort();

    if matches.is_empty() {
        return Err(PipelineError::Repository(format!(
            "no files under {} match {}",
            root.display(),
            patterns.join(", ")
        )));
    }
    Ok(matches)
}
