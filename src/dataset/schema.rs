//! Publish-time schema validation for datasets.
//!
//! Validation is pure: it reports every violation it finds and never
//! modifies or drops records.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Dataset;
use crate::error::DatasetError;
use crate::task::{Record, TaskId};

pub const CANDIDATE_FIELDS: [&str; 8] = [
    "task_id",
    "repo",
    "commit_sha",
    "subject",
    "task_description",
    "patches",
    "reasoning",
    "matching_files",
];

pub const VALIDATED_FIELDS: [&str; 8] = [
    "task_id",
    "repo",
    "commit_message",
    "container",
    "log",
    "tips",
    "src.diff",
    "tests.diff",
];

pub const CHECK_FIELDS: [&str; 2] = ["task_id", "verdict"];

/// Result of validating a dataset against the publish schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaValidationResult {
    /// Whether the dataset may be merged or published.
    pub valid: bool,
    pub errors: Vec<SchemaError>,
    /// Reported, but do not block publishing.
    pub warnings: Vec<SchemaError>,
}

impl SchemaValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(SchemaError {
            field: field.into(),
            message: message.into(),
            severity: ErrorSeverity::Error,
        });
        self.valid = false;
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(SchemaError {
            field: field.into(),
            message: message.into(),
            severity: ErrorSeverity::Warning,
        });
    }

    /// One line per error, `field: message`.
    pub fn violations(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect()
    }

    /// `Err(SchemaViolation)` naming `dataset` if any error was found.
    pub fn into_result(self, dataset: &str) -> Result<Self, DatasetError> {
        if self.valid {
            Ok(self)
        } else {
            Err(DatasetError::SchemaViolation {
                dataset: dataset.to_string(),
                violations: self.violations(),
            })
        }
    }
}

/// A schema validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaError {
    /// Location of the violation, e.g. `validated[3].src.diff`.
    pub field: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// Validator for the three parallel task ledgers.
pub struct SchemaValidator;

impl SchemaValidator {
    /// Validates a dataset.
    ///
    /// Checks performed:
    /// - every required field is present and non-null;
    /// - `task_id` is a well-formed `<prefix>/<index>` string;
    /// - `task_id` is unique within each ledger;
    /// - every validated record matches exactly one candidate;
    /// - `verdict` is `pass` or `fail`.
    ///
    /// A check result for a task with no validated record is a warning.
    pub fn validate(dataset: &Dataset) -> SchemaValidationResult {
        let mut result = SchemaValidationResult::valid();

        let candidates = Self::validate_ledger("tasks", &dataset.candidates, &CANDIDATE_FIELDS, &mut result);
        let validated = Self::validate_ledger("validated", &dataset.validated, &VALIDATED_FIELDS, &mut result);
        Self::validate_ledger("checks", &dataset.checks, &CHECK_FIELDS, &mut result);

        for (line, record) in dataset.candidates.iter().enumerate() {
            if let Some(files) = record.get("matching_files") {
                if !files.is_null() && !files.is_array() {
                    result.add_error(
                        format!("tasks[{line}].matching_files"),
                        "matching_files must be a list of paths",
                    );
                }
            }
        }

        let candidate_counts = counts(&candidates);
        for (line, task_id) in validated.iter().enumerate().filter_map(|(l, id)| Some((l, id.as_ref()?))) {
            match candidate_counts.get(task_id.as_str()).copied().unwrap_or(0) {
                0 => result.add_error(
                    format!("validated[{line}].task_id"),
                    format!("'{task_id}' has no matching candidate task"),
                ),
                1 => {}
                n => result.add_error(
                    format!("validated[{line}].task_id"),
                    format!("'{task_id}' matches {n} candidate tasks"),
                ),
            }
        }

        let validated_ids: HashSet<&str> = validated.iter().flatten().map(String::as_str).collect();
        for (line, record) in dataset.checks.iter().enumerate() {
            if let Some(Value::String(verdict)) = record.get("verdict") {
                if verdict != "pass" && verdict != "fail" {
                    result.add_error(
                        format!("checks[{line}].verdict"),
                        format!("verdict must be 'pass' or 'fail', got '{verdict}'"),
                    );
                }
            } else if record.get("verdict").is_some_and(|v| !v.is_null()) {
                result.add_error(format!("checks[{line}].verdict"), "verdict must be a string");
            }
            if let Some(Value::String(task_id)) = record.get("task_id") {
                if !validated_ids.contains(task_id.as_str()) {
                    result.add_warning(
                        format!("checks[{line}].task_id"),
                        format!("'{task_id}' has no validated task"),
                    );
                }
            }
        }

        result
    }

    /// Field, task_id and uniqueness checks for one ledger. Returns each
    /// line's well-formed task_id.
    fn validate_ledger(
        ledger: &str,
        records: &[Record],
        required: &[&str],
        result: &mut SchemaValidationResult,
    ) -> Vec<Option<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(records.len());
        for (line, record) in records.iter().enumerate() {
            for field in required {
                if record.get(*field).map_or(true, Value::is_null) {
                    result.add_error(format!("{ledger}[{line}].{field}"), "missing required field");
                }
            }

            let task_id = match record.get("task_id") {
                Some(Value::String(raw)) => match raw.parse::<TaskId>() {
                    Ok(_) => Some(raw.clone()),
                    Err(e) => {
                        result.add_error(
                            format!("{ledger}[{line}].task_id"),
                            format!("invalid task_id '{raw}': {e}"),
                        );
                        None
                    }
                },
                Some(Value::Null) | None => None,
                Some(_) => {
                    result.add_error(format!("{ledger}[{line}].task_id"), "task_id must be a string");
                    None
                }
            };
            if let Some(id) = &task_id {
                if !seen.insert(id.clone()) {
                    result.add_error(
                        format!("{ledger}[{line}].task_id"),
                        format!("duplicate task_id '{id}'"),
                    );
                }
            }
            ids.push(task_id);
        }
        ids
    }
}

fn counts(ids: &[Option<String>]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for id in ids.iter().flatten() {
        *counts.entry(id.as_str()).or_insert(0) += 1;
    }
    counts
}
