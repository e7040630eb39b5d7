//! Append-only JSON Lines ledger.
//!
//! Each record is one JSON object terminated by `\n`. Appends are made
//! indivisible across processes by holding an exclusive `flock` on the file
//! while the complete line is written with a single `write_all` on an
//! `O_APPEND` descriptor. A line without its terminating newline can only be
//! the remains of a crashed writer: readers ignore it and the next appender
//! truncates it away before writing.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LedgerError;

const TAIL_SCAN_CHUNK: u64 = 4096;

/// A typed handle to one JSONL ledger file.
///
/// The handle holds no open descriptor; every operation opens the file,
/// so handles are cheap to clone and safe to share between workers.
#[derive(Debug)]
pub struct Ledger<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Ledger<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> Ledger<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Opens a ledger at `path`, creating its parent directory.
    ///
    /// The file itself is created by the first append; a missing file reads
    /// as an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }
        Ok(Self {
            path,
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of readable records.
    pub fn count(&self) -> Result<usize, LedgerError> {
        Ok(self.read_all()?.len())
    }

    /// All readable records in append order.
    pub fn read_all(&self) -> Result<Vec<T>, LedgerError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LedgerError::io(&self.path, e)),
        };

        let complete = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => &bytes[..=last_newline],
            None => &[][..],
        };
        if complete.len() < bytes.len() {
            debug!(
                path = %self.path.display(),
                ignored_bytes = bytes.len() - complete.len(),
                "Ignoring unterminated ledger tail"
            );
        }

        let mut records = Vec::new();
        for (line_no, line) in complete.split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping undecodable ledger line"
                ),
            }
        }
        Ok(records)
    }

    /// Appends one record and flushes it to disk before returning.
    pub fn append(&self, record: &T) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(record).map_err(|source| LedgerError::Encode {
            path: self.path.display().to_string(),
            source,
        })?;
        line.push(b'\n');

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::io(&self.path, e))?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| LedgerError::io(&self.path, errno.into()))?;

        repair_tail(&file, &self.path)?;
        file.write_all(&line)
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| LedgerError::io(&self.path, e))?;
        Ok(())
    }
}

/// Truncates a partial trailing line left behind by a crashed writer.
///
/// Must be called with the exclusive lock held.
fn repair_tail(file: &File, path: &Path) -> Result<(), LedgerError> {
    let len = file
        .metadata()
        .map_err(|e| LedgerError::io(path, e))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.read_exact_at(&mut last, len - 1)
        .map_err(|e| LedgerError::io(path, e))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut end = len;
    let mut keep = 0;
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact_at(&mut buf, start)
            .map_err(|e| LedgerError::io(path, e))?;
        if let Some(pos) = buf.iter().rposition(|&b| b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    warn!(
        path = %path.display(),
        discarded_bytes = len - keep,
        "Truncating partial record left by an interrupted append"
    );
    file.set_len(keep).map_err(|e| LedgerError::io(path, e))
}
