//! Publishing behaviour: schema checks and collision-free merges on disk.

use bench_forge::dataset::{merge, CollisionPolicy, Dataset, SchemaValidator};
use bench_forge::task::Record;
use bench_forge::DatasetError;
use serde_json::{json, Value};
use tempfile::TempDir;

fn record(value: Value) -> Record {
    serde_json::from_value(value).unwrap()
}

fn candidate(id: &str, subject: &str) -> Record {
    record(json!({
        "task_id": id,
        "repo": "/data/repoA",
        "commit_sha": "0123abcd",
        "subject": subject,
        "task_description": format!("Re-implement {subject}"),
        "patches": "<<<<<<< SEARCH",
        "reasoning": "",
        "matching_files": ["src.py"],
    }))
}

fn validated(id: &str, message: &str) -> Record {
    record(json!({
        "task_id": id,
        "repo": "/data/repoA",
        "commit_message": message,
        "container": "env_agent__repoa",
        "log": "",
        "tips": "",
        "src.diff": "diff --git a/src.py b/src.py",
        "tests.diff": "diff --git a/test_src.py b/test_src.py",
    }))
}

fn check(id: &str, verdict: &str) -> Record {
    record(json!({ "task_id": id, "verdict": verdict }))
}

fn existing() -> Dataset {
    let ids = ["repoA/3", "repoA/7"];
    Dataset {
        candidates: ids.iter().map(|id| candidate(id, "existing")).collect(),
        validated: ids.iter().map(|id| validated(id, "existing")).collect(),
        checks: ids.iter().map(|id| check(id, "pass")).collect(),
    }
}

fn incoming() -> Dataset {
    Dataset {
        candidates: vec![candidate("repoA/3", "incoming"), candidate("repoB/0", "incoming")],
        validated: vec![validated("repoA/3", "incoming"), validated("repoB/0", "incoming")],
        checks: vec![check("repoA/3", "fail")],
    }
}

fn subjects_for(dataset: &Dataset, id: &str) -> Vec<String> {
    dataset
        .candidates
        .iter()
        .filter(|r| r["task_id"] == id)
        .map(|r| r["subject"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_skip_keeps_existing_records() {
    let outcome = merge(&existing(), &incoming(), CollisionPolicy::Skip).unwrap();

    assert_eq!(outcome.report.collisions, vec!["repoA/3"]);
    assert_eq!(outcome.report.skipped, 1);
    assert_eq!(outcome.report.carried, 1);
    assert_eq!(subjects_for(&outcome.dataset, "repoA/3"), vec!["existing"]);
    assert!(outcome.additions.checks.is_empty());
    assert_eq!(outcome.dataset.candidates.len(), 3);
    assert!(SchemaValidator::validate(&outcome.dataset).valid);
}

#[test]
fn test_renumber_rewrites_every_ledger() {
    let outcome = merge(&existing(), &incoming(), CollisionPolicy::Renumber).unwrap();

    assert_eq!(outcome.renames.get("repoA/3").map(String::as_str), Some("repoA/8"));
    assert_eq!(subjects_for(&outcome.dataset, "repoA/3"), vec!["existing"]);
    assert_eq!(subjects_for(&outcome.dataset, "repoA/8"), vec!["incoming"]);
    for ledger in [&outcome.additions.candidates, &outcome.additions.validated, &outcome.additions.checks] {
        assert!(ledger.iter().all(|r| r["task_id"] != "repoA/3"));
    }
    let moved_check = &outcome.additions.checks[0];
    assert_eq!(moved_check["task_id"], "repoA/8");
    assert_eq!(moved_check["verdict"], "fail");
    assert!(SchemaValidator::validate(&outcome.dataset).valid);
}

#[test]
fn test_orphan_validated_record_blocks_merge() {
    let mut broken = incoming();
    broken.validated.push(validated("repoB/5", "orphan"));

    let err = merge(&existing(), &broken, CollisionPolicy::Renumber).unwrap_err();
    match err {
        DatasetError::SchemaViolation { dataset, violations } => {
            assert_eq!(dataset, "new");
            assert!(violations.iter().any(|v| v.contains("repoB/5")));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_merge_round_trip_through_state_directories() {
    let existing_dir = TempDir::new().unwrap();
    let new_dir = TempDir::new().unwrap();
    existing().write_to(existing_dir.path()).unwrap();

    // A force-fresh rerun left two validated records for repoA/3.
    let mut rerun = incoming();
    rerun.validated.push(validated("repoA/3", "incoming, revalidated"));
    rerun.write_to(new_dir.path()).unwrap();

    let new = Dataset::load(new_dir.path()).unwrap();
    assert!(!SchemaValidator::validate(&new).valid);
    let new = new.compact();
    assert!(SchemaValidator::validate(&new).valid);

    let before = Dataset::load(existing_dir.path()).unwrap();
    let outcome = merge(&before, &new, CollisionPolicy::Renumber).unwrap();
    outcome.additions.write_to(existing_dir.path()).unwrap();

    let after = Dataset::load(existing_dir.path()).unwrap();
    assert_eq!(after, outcome.dataset);
    assert_eq!(after.candidates[..2], before.candidates[..]);
    let messages: Vec<&str> = after
        .validated
        .iter()
        .filter(|r| r["task_id"] == "repoA/8")
        .map(|r| r["commit_message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, vec!["incoming, revalidated"]);
}
