//! Task identifiers of the form `<prefix>/<index>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors from parsing a task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskIdError {
    #[error("task id '{0}' has no '/' separator")]
    MissingSeparator(String),

    #[error("task id '{0}' has an empty prefix")]
    EmptyPrefix(String),

    #[error("task id '{0}' has an invalid index (expected a non-negative integer without leading zeros)")]
    InvalidIndex(String),
}

/// Identifier tying together a task's candidate, validated and check records.
///
/// The prefix names the task family (usually the repository) and may itself
/// contain `/`; the index is whatever follows the last `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    prefix: String,
    index: u64,
}

impl TaskId {
    pub fn new(prefix: impl Into<String>, index: u64) -> Result<Self, TaskIdError> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(TaskIdError::EmptyPrefix(format!("{prefix}/{index}")));
        }
        Ok(Self { prefix, index })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Same prefix, different index.
    pub fn with_index(&self, index: u64) -> Self {
        Self {
            prefix: self.prefix.clone(),
            index,
        }
    }

    /// Next identifier for `prefix` given the identifiers already in use.
    ///
    /// Returns `<prefix>/<max + 1>`, or `<prefix>/0` when the prefix is
    /// unused. Malformed identifiers are ignored.
    pub fn next_in<'a, I>(prefix: &str, existing: I) -> Result<Self, TaskIdError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let next = existing
            .into_iter()
            .filter_map(|raw| raw.parse::<TaskId>().ok())
            .filter(|id| id.prefix == prefix)
            .map(|id| id.index + 1)
            .max()
            .unwrap_or(0);
        Self::new(prefix, next)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.index)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, index) = s
            .rsplit_once('/')
            .ok_or_else(|| TaskIdError::MissingSeparator(s.to_string()))?;
        if prefix.trim().is_empty() {
            return Err(TaskIdError::EmptyPrefix(s.to_string()));
        }
        // Leading zeros would let "a/07" and "a/7" name the same task.
        let canonical = index == "0" || !index.starts_with('0');
        if index.is_empty() || !canonical || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TaskIdError::InvalidIndex(s.to_string()));
        }
        let index = index
            .parse::<u64>()
            .map_err(|_| TaskIdError::InvalidIndex(s.to_string()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            index,
        })
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
