//! Diff-to-operation compiler
//!
//! Turns an old and a new version of one collection into the ordered
//! storage operations that take the first to the second, without touching
//! records that still carry un-pushed local edits.

use crate::record::{Record, Uid};
use crate::state::{MutationState, StateSnapshot};
use std::collections::{HashMap, HashSet};

/// A single storage mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert(Record),
    /// Carries the local identity of the record it replaces
    Update(Record),
    Delete(Record),
}

impl Operation {
    pub fn record(&self) -> &Record {
        match self {
            Operation::Insert(record) | Operation::Update(record) | Operation::Delete(record) => {
                record
            }
        }
    }

    pub fn record_mut(&mut self) -> &mut Record {
        match self {
            Operation::Insert(record) | Operation::Update(record) | Operation::Delete(record) => {
                record
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert(_) => "insert",
            Operation::Update(_) => "update",
            Operation::Delete(_) => "delete",
        }
    }
}

/// Compile the operations turning `old` into `new`.
///
/// Output order: deletes in `old` order, then updates, then inserts, both
/// in `new` order. Only the first occurrence of a UID counts.
///
/// - UID only in `old`: `Delete`, unless the record is `PendingCreate` or
///   `PendingUpdate`
/// - UID in both: `Update` when `new` is strictly newer and the stored
///   record is neither dirty nor `PendingDelete`
/// - UID only in `new`: `Insert`
pub fn compile(old: &[Record], new: &[Record], states: &StateSnapshot) -> Vec<Operation> {
    let mut old_by_uid: HashMap<&Uid, &Record> = HashMap::with_capacity(old.len());
    for record in old {
        old_by_uid.entry(&record.uid).or_insert(record);
    }
    let new_uids: HashSet<&Uid> = new.iter().filter(|r| r.uid.is_valid()).map(|r| &r.uid).collect();

    let mut operations = Vec::new();

    let mut seen_old: HashSet<&Uid> = HashSet::with_capacity(old.len());
    for record in old {
        if !seen_old.insert(&record.uid) || new_uids.contains(&record.uid) {
            continue;
        }
        let Some(local_id) = record.local_id else {
            continue;
        };
        if states.get(&local_id).is_some_and(MutationState::is_dirty) {
            continue;
        }
        operations.push(Operation::Delete(record.clone()));
    }

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    let mut seen_new: HashSet<&Uid> = HashSet::with_capacity(new.len());
    for record in new.iter().filter(|r| r.uid.is_valid()) {
        if !seen_new.insert(&record.uid) {
            continue;
        }
        match old_by_uid.get(&record.uid) {
            Some(previous) => {
                if record.last_modified <= previous.last_modified {
                    continue;
                }
                let state = previous.local_id.and_then(|id| states.get(&id)).copied();
                if matches!(state, Some(s) if s != MutationState::Synced) {
                    continue;
                }
                let mut updated = record.clone();
                updated.local_id = previous.local_id;
                updates.push(Operation::Update(updated));
            }
            None => {
                let mut inserted = record.clone();
                inserted.local_id = None;
                inserts.push(Operation::Insert(inserted));
            }
        }
    }

    operations.extend(updates);
    operations.extend(inserts);
    operations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_db::tests::ts;
    use proptest::prelude::*;

    fn stored(uid: &str, modified: i64, local_id: i64) -> Record {
        Record::new("event", uid, ts(modified)).with_local_id(local_id)
    }

    fn fresh(uid: &str, modified: i64) -> Record {
        Record::new("event", uid, ts(modified))
    }

    #[test]
    fn test_identical_collections_compile_to_nothing() {
        let old = vec![stored("A", 1, 1)];
        let new = vec![stored("A", 1, 1)];
        assert!(compile(&old, &new, &StateSnapshot::new()).is_empty());
    }

    #[test]
    fn test_removed_synced_record_is_deleted() {
        let old = vec![stored("A", 1, 1)];
        let mut states = StateSnapshot::new();
        states.insert(1, MutationState::Synced);

        let ops = compile(&old, &[], &states);
        assert_eq!(ops, vec![Operation::Delete(stored("A", 1, 1))]);

        // no ledger entry counts as synced
        let ops = compile(&old, &[], &StateSnapshot::new());
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_dirty_records_are_never_deleted() {
        let old = vec![stored("A", 1, 1), stored("B", 1, 2), stored("C", 1, 3)];
        let mut states = StateSnapshot::new();
        states.insert(1, MutationState::PendingCreate);
        states.insert(2, MutationState::PendingUpdate);
        states.insert(3, MutationState::PendingDelete);

        let ops = compile(&old, &[], &states);
        assert_eq!(ops, vec![Operation::Delete(stored("C", 1, 3))]);
    }

    #[test]
    fn test_newer_version_is_updated_with_old_identity() {
        let old = vec![stored("A", 1, 4)];
        let new = vec![fresh("A", 2)];

        let ops = compile(&old, &new, &StateSnapshot::new());
        assert_eq!(ops, vec![Operation::Update(stored("A", 2, 4))]);
    }

    #[test]
    fn test_older_or_equal_version_is_skipped() {
        let old = vec![stored("A", 5, 1), stored("B", 5, 2)];
        let new = vec![fresh("A", 5), fresh("B", 3)];
        assert!(compile(&old, &new, &StateSnapshot::new()).is_empty());
    }

    #[test]
    fn test_dirty_and_pending_delete_records_are_not_overwritten() {
        let old = vec![stored("A", 1, 1), stored("B", 1, 2)];
        let new = vec![fresh("A", 9), fresh("B", 9)];
        let mut states = StateSnapshot::new();
        states.insert(1, MutationState::PendingUpdate);
        states.insert(2, MutationState::PendingDelete);

        assert!(compile(&old, &new, &states).is_empty());
    }

    #[test]
    fn test_operation_order() {
        let old = vec![
            stored("D1", 1, 1),
            stored("U1", 1, 2),
            stored("D2", 1, 3),
            stored("U2", 1, 4),
        ];
        let new = vec![fresh("I1", 1), fresh("U2", 2), fresh("I2", 1), fresh("U1", 2)];

        let ops = compile(&old, &new, &StateSnapshot::new());
        let summary: Vec<(&str, &str)> = ops
            .iter()
            .map(|op| (op.as_str(), op.record().uid.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("delete", "D1"),
                ("delete", "D2"),
                ("update", "U2"),
                ("update", "U1"),
                ("insert", "I1"),
                ("insert", "I2"),
            ]
        );
    }

    #[test]
    fn test_invalid_uids_are_ignored() {
        let ops = compile(&[], &[fresh("", 1)], &StateSnapshot::new());
        assert!(ops.is_empty());
    }

    /// Apply operations to an in-memory copy of `old`
    fn apply(old: &[Record], ops: &[Operation]) -> Vec<Record> {
        let mut result: Vec<Record> = old.to_vec();
        for op in ops {
            match op {
                Operation::Delete(record) => result.retain(|r| r.uid != record.uid),
                Operation::Update(record) => {
                    for r in result.iter_mut().filter(|r| r.uid == record.uid) {
                        *r = record.clone();
                    }
                }
                Operation::Insert(record) => result.push(record.clone()),
            }
        }
        result
    }

    fn normalized(records: &[Record]) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = records
            .iter()
            .map(|r| (r.uid.as_str().to_string(), r.last_modified.timestamp()))
            .collect();
        out.sort();
        out
    }

    proptest! {
        #[test]
        fn prop_compile_round_trips(
            old_keys in prop::collection::btree_map(0u8..16, 0i64..5, 0..12),
            new_keys in prop::collection::btree_map(0u8..16, 0i64..5, 0..12),
        ) {
            let old: Vec<Record> = old_keys
                .iter()
                .enumerate()
                .map(|(i, (k, m))| stored(&format!("r{}", k), *m, i as i64 + 1))
                .collect();
            // new versions never move backwards in time
            let new: Vec<Record> = new_keys
                .iter()
                .map(|(k, m)| {
                    let floor = old_keys.get(k).copied().unwrap_or(0);
                    fresh(&format!("r{}", k), floor + m)
                })
                .collect();

            let ops = compile(&old, &new, &StateSnapshot::new());
            prop_assert_eq!(normalized(&apply(&old, &ops)), normalized(&new));
        }

        #[test]
        fn prop_compile_is_deterministic(
            old_keys in prop::collection::btree_map(0u8..16, 0i64..5, 0..12),
            new_keys in prop::collection::vec((0u8..16, 0i64..5), 0..12),
        ) {
            let old: Vec<Record> = old_keys
                .iter()
                .enumerate()
                .map(|(i, (k, m))| stored(&format!("r{}", k), *m, i as i64 + 1))
                .collect();
            let new: Vec<Record> = new_keys
                .iter()
                .map(|(k, m)| fresh(&format!("r{}", k), *m))
                .collect();

            prop_assert_eq!(
                compile(&old, &new, &StateSnapshot::new()),
                compile(&old, &new, &StateSnapshot::new())
            );
        }

        #[test]
        fn prop_dirty_records_are_protected(
            old_keys in prop::collection::btree_map(0u8..16, 0i64..5, 1..12),
            new_keys in prop::collection::vec((0u8..16, 0i64..10), 0..12),
            dirty_mask in prop::collection::vec(any::<bool>(), 12),
        ) {
            let old: Vec<Record> = old_keys
                .iter()
                .enumerate()
                .map(|(i, (k, m))| stored(&format!("r{}", k), *m, i as i64 + 1))
                .collect();
            let new: Vec<Record> = new_keys
                .iter()
                .map(|(k, m)| fresh(&format!("r{}", k), *m))
                .collect();

            let mut states = StateSnapshot::new();
            for (i, dirty) in dirty_mask.iter().enumerate().take(old.len()) {
                if *dirty {
                    let state = if i % 2 == 0 {
                        MutationState::PendingCreate
                    } else {
                        MutationState::PendingUpdate
                    };
                    states.insert(i as i64 + 1, state);
                }
            }

            for op in compile(&old, &new, &states) {
                if let Operation::Delete(record) | Operation::Update(record) = &op {
                    let state = record.local_id.and_then(|id| states.get(&id));
                    prop_assert!(!state.is_some_and(MutationState::is_dirty));
                }
            }
        }
    }
}
