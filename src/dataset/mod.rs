//! Published datasets: the three parallel task ledgers of a state directory.
//!
//! Records are handled as raw JSON objects so a dataset written by another
//! version of the pipeline can still be validated and merged.

mod merge;
mod schema;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::DatasetError;
use crate::ledger::{Ledger, StatePaths};
use crate::task::{Keyed, Record};

pub use merge::{merge, CollisionPolicy, MergeOutcome, MergeReport};
pub use schema::{
    ErrorSeverity, SchemaError, SchemaValidationResult, SchemaValidator, CANDIDATE_FIELDS,
    CHECK_FIELDS, VALIDATED_FIELDS,
};

/// Candidate, validated and check ledgers that belong together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub candidates: Vec<Record>,
    pub validated: Vec<Record>,
    pub checks: Vec<Record>,
}

impl Dataset {
    /// Reads the ledgers of a state directory. Missing ledger files are empty.
    pub fn load(dir: &Path) -> Result<Self, DatasetError> {
        if !dir.is_dir() {
            return Err(DatasetError::NotFound(dir.display().to_string()));
        }
        let paths = StatePaths::new(dir);
        Ok(Self {
            candidates: Ledger::<Record>::open(paths.tasks())?.read_all()?,
            validated: Ledger::<Record>::open(paths.validated())?.read_all()?,
            checks: Ledger::<Record>::open(paths.checks())?.read_all()?,
        })
    }

    /// Appends every record to the ledgers under `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<(), DatasetError> {
        let paths = StatePaths::new(dir);
        for (path, records) in [
            (paths.tasks(), &self.candidates),
            (paths.validated(), &self.validated),
            (paths.checks(), &self.checks),
        ] {
            let ledger = Ledger::<Record>::open(path)?;
            for record in records {
                ledger.append(record)?;
            }
        }
        info!(
            dir = %dir.display(),
            candidates = self.candidates.len(),
            validated = self.validated.len(),
            checks = self.checks.len(),
            "Appended dataset records"
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.validated.is_empty() && self.checks.is_empty()
    }

    /// Every task_id used in any ledger.
    pub fn task_ids(&self) -> BTreeSet<String> {
        self.ledgers()
            .flat_map(|records| records.iter().filter_map(Keyed::task_key))
            .collect()
    }

    /// Keeps only the latest record per task_id in each ledger, at the
    /// position of that task_id's first record. Unkeyed records are kept.
    pub fn compact(&self) -> Self {
        Self {
            candidates: compact_records(&self.candidates),
            validated: compact_records(&self.validated),
            checks: compact_records(&self.checks),
        }
    }

    /// `sha256:<hex>` over the canonical JSON of every record, ledger by ledger.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, records) in ["tasks", "validated", "checks"].iter().zip(self.ledgers()) {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
            for record in records {
                hasher.update(Value::Object(record.clone()).to_string().as_bytes());
                hasher.update(b"\n");
            }
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    fn ledgers(&self) -> impl Iterator<Item = &Vec<Record>> {
        [&self.candidates, &self.validated, &self.checks].into_iter()
    }
}

fn compact_records(records: &[Record]) -> Vec<Record> {
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for record in records {
        match record.task_key() {
            Some(key) => match positions.get(&key) {
                Some(&pos) => out[pos] = record.clone(),
                None => {
                    positions.insert(key, out.len());
                    out.push(record.clone());
                }
            },
            None => out.push(record.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_compact_keeps_latest_at_first_position() {
        let dataset = Dataset {
            candidates: Vec::new(),
            validated: vec![
                record(json!({"task_id": "a/0", "log": "first"})),
                record(json!({"task_id": "a/1", "log": "only"})),
                record(json!({"task_id": "a/0", "log": "second"})),
            ],
            checks: Vec::new(),
        };
        let compacted = dataset.compact();
        assert_eq!(compacted.validated.len(), 2);
        assert_eq!(compacted.validated[0]["log"], "second");
        assert_eq!(compacted.validated[1]["task_id"], "a/1");
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = TempDir::new().unwrap();
        let err = Dataset::load(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let dataset = Dataset {
            candidates: vec![record(json!({"task_id": "a/0", "subject": "x"}))],
            validated: vec![record(json!({"task_id": "a/0"}))],
            checks: vec![record(json!({"task_id": "a/0", "verdict": "pass"}))],
        };
        dataset.write_to(dir.path()).unwrap();
        let loaded = Dataset::load(dir.path()).unwrap();
        assert_eq!(loaded, dataset);
        assert_eq!(loaded.digest(), dataset.digest());
        assert_eq!(loaded.task_ids().into_iter().collect::<Vec<_>>(), vec!["a/0"]);
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = Dataset {
            checks: vec![record(json!({"task_id": "a/0", "verdict": "pass"}))],
            ..Dataset::default()
        };
        let b = Dataset {
            checks: vec![record(json!({"task_id": "a/0", "verdict": "fail"}))],
            ..Dataset::default()
        };
        assert_ne!(a.digest(), b.digest());
        assert!(Dataset::default().is_empty());
    }
}
