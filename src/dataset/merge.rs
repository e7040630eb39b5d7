//! Collision-free merging of two datasets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{Dataset, SchemaValidator};
use crate::error::DatasetError;
use crate::task::{Keyed, Record, TaskId};

/// What to do with a new task whose id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Drop every record of the colliding task from the new dataset.
    #[default]
    Skip,
    /// Move the colliding task to the next free index under its prefix.
    Renumber,
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionPolicy::Skip => write!(f, "skip"),
            CollisionPolicy::Renumber => write!(f, "renumber"),
        }
    }
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(CollisionPolicy::Skip),
            "renumber" => Ok(CollisionPolicy::Renumber),
            other => Err(format!("unknown collision policy '{other}' (expected skip or renumber)")),
        }
    }
}

/// Per-task tallies of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// New tasks carried over under their own id.
    pub carried: usize,
    pub skipped: usize,
    pub renumbered: usize,
    /// New task ids that already existed, in the order they were met.
    pub collisions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Existing records followed by the additions.
    pub dataset: Dataset,
    /// Records to append to the existing dataset.
    pub additions: Dataset,
    /// Old id to new id for every renumbered task.
    pub renames: BTreeMap<String, String>,
    pub report: MergeReport,
}

/// Merges `new` into `existing`.
///
/// Both datasets must pass [`SchemaValidator`] first; a violation in either
/// blocks the merge. The result never reuses a task id: a renumbered task
/// gets `max existing index + 1` for its prefix, stepping past any id the
/// new dataset already uses. Every ledger entry of a task follows the same
/// decision, so candidate, validated and check records stay aligned.
pub fn merge(
    existing: &Dataset,
    new: &Dataset,
    policy: CollisionPolicy,
) -> Result<MergeOutcome, DatasetError> {
    SchemaValidator::validate(existing).into_result("existing")?;
    SchemaValidator::validate(new).into_result("new")?;

    let existing_ids = parse_ids(existing);
    let new_ids = parse_ids(new);

    let mut next_index: HashMap<String, u64> = HashMap::new();
    for id in &existing_ids {
        let next = next_index.entry(id.prefix().to_string()).or_insert(0);
        *next = (*next).max(id.index() + 1);
    }
    let mut taken: HashSet<TaskId> = existing_ids.iter().chain(new_ids.iter()).cloned().collect();
    let existing_set: HashSet<&TaskId> = existing_ids.iter().collect();

    let mut report = MergeReport::default();
    let mut renames = BTreeMap::new();
    let mut dropped = HashSet::new();
    let mut seen = HashSet::new();
    for id in &new_ids {
        if !seen.insert(id.clone()) {
            continue;
        }
        if !existing_set.contains(id) {
            report.carried += 1;
            continue;
        }
        report.collisions.push(id.to_string());
        match policy {
            CollisionPolicy::Skip => {
                report.skipped += 1;
                dropped.insert(id.to_string());
            }
            CollisionPolicy::Renumber => {
                let next = next_index.entry(id.prefix().to_string()).or_insert(0);
                let mut renamed = id.with_index(*next);
                while taken.contains(&renamed) {
                    renamed = renamed.with_index(renamed.index() + 1);
                }
                *next = renamed.index() + 1;
                taken.insert(renamed.clone());
                debug!(from = %id, to = %renamed, "Renumbering colliding task");
                renames.insert(id.to_string(), renamed.to_string());
                report.renumbered += 1;
            }
        }
    }

    let rewrite = |records: &[Record]| -> Vec<Record> {
        records
            .iter()
            .filter(|r| r.task_key().map_or(true, |k| !dropped.contains(&k)))
            .map(|r| {
                let mut record = r.clone();
                if let Some(renamed) = r.task_key().and_then(|k| renames.get(&k)) {
                    record.insert("task_id".to_string(), Value::String(renamed.clone()));
                }
                record
            })
            .collect()
    };
    let additions = Dataset {
        candidates: rewrite(&new.candidates),
        validated: rewrite(&new.validated),
        checks: rewrite(&new.checks),
    };

    let mut dataset = existing.clone();
    dataset.candidates.extend(additions.candidates.iter().cloned());
    dataset.validated.extend(additions.validated.iter().cloned());
    dataset.checks.extend(additions.checks.iter().cloned());

    info!(
        policy = %policy,
        carried = report.carried,
        skipped = report.skipped,
        renumbered = report.renumbered,
        "Merged datasets"
    );
    Ok(MergeOutcome {
        dataset,
        additions,
        renames,
        report,
    })
}

/// Task ids in ledger order: candidates, validated, checks.
fn parse_ids(dataset: &Dataset) -> Vec<TaskId> {
    [&dataset.candidates, &dataset.validated, &dataset.checks]
        .into_iter()
        .flatten()
        .filter_map(|r| r.task_key()?.parse().ok())
        .collect()
}
