//! Resume planning.
//!
//! Everything here is a pure function of ledger contents: a stage's progress
//! is however many records its ledger holds, so restarting after a crash or a
//! partial run needs no checkpoint beyond the ledgers themselves.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::task::Keyed;

/// How a stage treats its existing output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Count existing records toward the target.
    #[default]
    Resume,
    /// Plan as if the stage's ledger were empty. Existing records stay on disk.
    ForceFresh,
}

impl ResumeMode {
    pub fn from_force_fresh(force_fresh: bool) -> Self {
        if force_fresh {
            ResumeMode::ForceFresh
        } else {
            ResumeMode::Resume
        }
    }

    fn effective_count(self, current: usize) -> usize {
        match self {
            ResumeMode::Resume => current,
            ResumeMode::ForceFresh => 0,
        }
    }
}

/// `max(target - current, 0)`, with `current` treated as 0 under force-fresh.
pub fn remaining_count(target: usize, current: usize, mode: ResumeMode) -> usize {
    target.saturating_sub(mode.effective_count(current))
}

/// One upstream record scheduled for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedItem<U> {
    /// Zero-based position of the record in the upstream ledger.
    pub line: usize,
    pub task_id: String,
    pub item: U,
}

impl<U> PlannedItem<U> {
    pub fn map<V>(self, f: impl FnOnce(U) -> V) -> PlannedItem<V> {
        PlannedItem {
            line: self.line,
            task_id: self.task_id,
            item: f(self.item),
        }
    }
}

/// The work a keyed stage still has to do.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPlan<U> {
    pub target: usize,
    /// Distinct upstream task_ids already present in the stage's own ledger
    /// (0 under force-fresh).
    pub current: usize,
    /// Upstream records not yet represented in the stage's own ledger.
    pub pending: usize,
    pub items: Vec<PlannedItem<U>>,
}

impl<U> WorkPlan<U> {
    pub fn empty(target: usize, current: usize) -> Self {
        Self {
            target,
            current,
            pending: 0,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|p| p.task_id.as_str())
    }

    /// Items whose upstream line index is `worker_index` modulo `worker_count`.
    ///
    /// Shards for `0..worker_count` are pairwise disjoint and together cover
    /// the plan.
    pub fn shard(&self, worker_index: usize, worker_count: usize) -> Vec<&PlannedItem<U>> {
        if worker_count == 0 {
            return Vec::new();
        }
        self.items
            .iter()
            .filter(|p| p.line % worker_count == worker_index)
            .collect()
    }

    /// Splits the plan into at most `worker_count` owned shards.
    pub fn into_shards(self, worker_count: usize) -> Vec<Vec<PlannedItem<U>>> {
        shard_items(self.items, worker_count)
    }
}

/// Groups items by upstream line index modulo `worker_count`, dropping empty
/// groups. Order within a shard follows the input order.
pub fn shard_items<U>(items: Vec<PlannedItem<U>>, worker_count: usize) -> Vec<Vec<PlannedItem<U>>> {
    let worker_count = worker_count.max(1);
    let mut shards: Vec<Vec<PlannedItem<U>>> = (0..worker_count).map(|_| Vec::new()).collect();
    for item in items {
        let slot = item.line % worker_count;
        shards[slot].push(item);
    }
    shards.retain(|s| !s.is_empty());
    shards
}

/// Plans an item-keyed stage.
///
/// Returns upstream records, in upstream order, whose `task_id` does not yet
/// appear in `own`, capped at `max(target - N, 0)`. `N` counts distinct
/// upstream task_ids that `own` already covers, so repeated records in `own`
/// (left by a force-fresh run) or records for unknown tasks never hide
/// pending work. Upstream records without a `task_id` are never planned, and
/// the plan never exceeds what upstream actually holds.
pub fn remaining_work<U, S>(upstream: &[U], own: &[S], target: usize, mode: ResumeMode) -> WorkPlan<U>
where
    U: Keyed + Clone,
    S: Keyed,
{
    let done: HashSet<String> = match mode {
        ResumeMode::Resume => own.iter().filter_map(Keyed::task_key).collect(),
        ResumeMode::ForceFresh => HashSet::new(),
    };

    let mut seen = HashSet::new();
    let mut covered = 0;
    let mut candidates: Vec<PlannedItem<U>> = Vec::new();
    for (line, record) in upstream.iter().enumerate() {
        let Some(task_id) = record.task_key() else {
            continue;
        };
        if !seen.insert(task_id.clone()) {
            continue;
        }
        if done.contains(&task_id) {
            covered += 1;
            continue;
        }
        candidates.push(PlannedItem {
            line,
            task_id,
            item: record.clone(),
        });
    }

    let current = mode.effective_count(covered);
    let deficit = remaining_count(target, current, mode);
    let pending = candidates.len();
    let items = candidates.into_iter().take(deficit).collect();
    WorkPlan {
        target,
        current,
        pending,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Record;
    use serde_json::json;

    fn records(ids: &[&str]) -> Vec<Record> {
        ids.iter()
            .map(|id| serde_json::from_value(json!({ "task_id": id })).unwrap())
            .collect()
    }

    #[test]
    fn test_remaining_count() {
        assert_eq!(remaining_count(5, 2, ResumeMode::Resume), 3);
        assert_eq!(remaining_count(3, 3, ResumeMode::Resume), 0);
        assert_eq!(remaining_count(3, 7, ResumeMode::Resume), 0);
        assert_eq!(remaining_count(3, 7, ResumeMode::ForceFresh), 3);
        assert_eq!(remaining_count(0, 0, ResumeMode::Resume), 0);
    }

    #[test]
    fn test_remaining_work_skips_done_items() {
        let upstream = records(&["a/0", "a/1", "a/2", "a/3"]);
        let own = records(&["a/1"]);
        let plan = remaining_work(&upstream, &own, 4, ResumeMode::Resume);
        assert_eq!(plan.current, 1);
        assert_eq!(plan.pending, 3);
        assert_eq!(plan.task_ids().collect::<Vec<_>>(), vec!["a/0", "a/2", "a/3"]);
        assert_eq!(plan.items[1].line, 2);
    }

    #[test]
    fn test_remaining_work_zero_when_target_met() {
        let upstream = records(&["a/0", "a/1", "a/2"]);
        let own = records(&["a/0", "a/1"]);
        let plan = remaining_work(&upstream, &own, 2, ResumeMode::Resume);
        assert!(plan.is_empty());
        assert_eq!(plan.pending, 1);
    }

    #[test]
    fn test_remaining_work_capped_at_upstream() {
        let upstream = records(&["a/0", "a/1"]);
        let own: Vec<Record> = Vec::new();
        let plan = remaining_work(&upstream, &own, 10, ResumeMode::Resume);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_remaining_work_ignores_unkeyed_and_duplicate_upstream() {
        let mut upstream = records(&["a/0", "a/0", "a/1"]);
        upstream.insert(1, serde_json::from_value(json!({ "subject": "no id" })).unwrap());
        let own: Vec<Record> = Vec::new();
        let plan = remaining_work(&upstream, &own, 10, ResumeMode::Resume);
        assert_eq!(plan.task_ids().collect::<Vec<_>>(), vec!["a/0", "a/1"]);
        assert_eq!(plan.items[1].line, 3);
    }

    #[test]
    fn test_force_fresh_ignores_own_ledger() {
        let upstream = records(&["a/0", "a/1", "a/2"]);
        let own = records(&["a/0", "a/1", "a/2"]);
        let plan = remaining_work(&upstream, &own, 2, ResumeMode::ForceFresh);
        assert_eq!(plan.current, 0);
        assert_eq!(plan.task_ids().collect::<Vec<_>>(), vec!["a/0", "a/1"]);
    }

    #[test]
    fn test_repeated_own_records_do_not_hide_pending_work() {
        // Resume after a force-fresh run: a/0 and a/2 were validated twice,
        // a/1 failed both times.
        let upstream = records(&["a/0", "a/1", "a/2"]);
        let own = records(&["a/0", "a/2", "a/0", "a/2", "b/9"]);
        let plan = remaining_work(&upstream, &own, 3, ResumeMode::Resume);
        assert_eq!(plan.current, 2);
        assert_eq!(plan.task_ids().collect::<Vec<_>>(), vec!["a/1"]);
    }

    #[test]
    fn test_shards_are_disjoint_and_cover_plan() {
        let upstream = records(&["a/0", "a/1", "a/2", "a/3", "a/4", "a/5", "a/6"]);
        let own = records(&["a/2"]);
        let plan = remaining_work(&upstream, &own, 10, ResumeMode::Resume);

        let mut covered: Vec<&str> = Vec::new();
        for worker in 0..3 {
            let shard = plan.shard(worker, 3);
            assert!(shard.iter().all(|p| p.line % 3 == worker));
            covered.extend(shard.iter().map(|p| p.task_id.as_str()));
        }
        covered.sort_unstable();
        let mut expected: Vec<&str> = plan.task_ids().collect();
        expected.sort_unstable();
        assert_eq!(covered, expected);
        assert!(plan.shard(0, 0).is_empty());
    }

    #[test]
    fn test_into_shards_drops_empty_slots() {
        let upstream = records(&["a/0", "a/1"]);
        let own: Vec<Record> = Vec::new();
        let plan = remaining_work(&upstream, &own, 10, ResumeMode::Resume);
        let shards = plan.into_shards(4);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), 2);
    }
}
