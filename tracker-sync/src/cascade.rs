//! Composite subtree regeneration
//!
//! Children of a composite record are never diffed field by field. When
//! the parent is inserted or updated from the server with its children
//! array, every stored descendant of a cascade kind is deleted and the
//! server's children are re-inserted. A parent fetched without a children
//! array leaves its stored subtree alone. Deleting the parent deletes its
//! descendants. Descendants with a pending mutation, deletions included,
//! are left in place.

use crate::diff::Operation;
use crate::error::SyncResult;
use crate::local_db::LocalDatabase;
use crate::record::{Record, RecordKind, Uid};
use crate::registry::ResourceBinding;
use crate::state::{MutationState, StateSnapshot};
use std::collections::{HashMap, HashSet, VecDeque};

/// Operations after cascade expansion
#[derive(Debug, Default)]
pub struct CascadePlan {
    pub operations: Vec<Operation>,
    /// Server children re-inserted under a regenerated parent
    pub children_regenerated: usize,
}

/// Expand parent operations of a composite kind with the operations on
/// their child subtrees.
///
/// Non-composite bindings pass through with any fetched children dropped.
pub async fn expand(
    db: &LocalDatabase,
    binding: &ResourceBinding,
    operations: Vec<Operation>,
) -> SyncResult<CascadePlan> {
    let mut plan = CascadePlan::default();
    if !binding.is_composite() {
        plan.operations = operations
            .into_iter()
            .map(|mut operation| {
                operation.record_mut().take_children();
                operation
            })
            .collect();
        return Ok(plan);
    }

    let mut states: HashMap<RecordKind, StateSnapshot> = HashMap::new();
    for kind in &binding.cascade {
        states.insert(kind.clone(), db.states_for(kind).await?);
    }

    for mut operation in operations {
        let children = operation.record_mut().take_children();
        let parent_uid = operation.record().uid.clone();
        let parent_scope = operation.record().scope.clone();
        let deleting = matches!(operation, Operation::Delete(_));

        match (deleting, children) {
            (true, _) => {
                let (descendants, _) = stored_subtree(db, binding, &states, &parent_uid).await?;
                plan.operations
                    .extend(descendants.into_iter().map(Operation::Delete));
                plan.operations.push(operation);
            }
            (false, Some(children)) => {
                let (descendants, protected) =
                    stored_subtree(db, binding, &states, &parent_uid).await?;
                plan.operations.push(operation);
                plan.operations
                    .extend(descendants.into_iter().map(Operation::Delete));

                let inserts = regenerated_children(
                    binding,
                    &parent_uid,
                    parent_scope.as_deref(),
                    children,
                    &protected,
                );
                plan.children_regenerated += inserts.len();
                plan.operations.extend(inserts);
            }
            (false, None) => {
                tracing::debug!(uid = %parent_uid, "No children fetched, keeping stored subtree");
                plan.operations.push(operation);
            }
        }
    }

    Ok(plan)
}

/// Stored descendants of `parent` that may be discarded, and the UIDs of
/// those that must survive
async fn stored_subtree(
    db: &LocalDatabase,
    binding: &ResourceBinding,
    states: &HashMap<RecordKind, StateSnapshot>,
    parent: &Uid,
) -> SyncResult<(Vec<Record>, HashSet<Uid>)> {
    let mut discard = Vec::new();
    let mut protected = HashSet::new();
    let mut pending = vec![parent.clone()];

    while let Some(uid) = pending.pop() {
        for child in db.query_children(&uid, &binding.cascade).await? {
            let Some(local_id) = child.local_id else {
                continue;
            };
            let state = states
                .get(&child.kind)
                .and_then(|snapshot| snapshot.get(&local_id))
                .copied()
                .unwrap_or(MutationState::Synced);
            if state.is_pending() {
                tracing::debug!(
                    kind = %child.kind,
                    uid = %child.uid,
                    parent = %uid,
                    state = state.as_str(),
                    "Keeping child with a pending mutation"
                );
                protected.insert(child.uid);
                continue;
            }
            pending.push(child.uid.clone());
            discard.push(child);
        }
    }

    Ok((discard, protected))
}

/// Insert operations for the server children of `parent`, each child
/// before its own children
fn regenerated_children(
    binding: &ResourceBinding,
    parent: &Uid,
    parent_scope: Option<&str>,
    children: Vec<Record>,
    protected: &HashSet<Uid>,
) -> Vec<Operation> {
    let mut inserts = Vec::new();
    let mut seen: HashSet<Uid> = HashSet::new();
    let mut queue: VecDeque<(Uid, Vec<Record>)> = VecDeque::from([(parent.clone(), children)]);

    while let Some((owner, children)) = queue.pop_front() {
        for mut child in children {
            if !child.uid.is_valid()
                || protected.contains(&child.uid)
                || !seen.insert(child.uid.clone())
            {
                continue;
            }
            if !binding.cascade.contains(&child.kind) {
                tracing::warn!(
                    kind = %child.kind,
                    uid = %child.uid,
                    parent = %owner,
                    "Skipping child of a kind outside the cascade"
                );
                continue;
            }

            let grandchildren = child.take_children().unwrap_or_default();
            child.local_id = None;
            child.parent = Some(owner.clone());
            if child.scope.is_none() {
                child.scope = parent_scope.map(str::to_string);
            }
            queue.push_back((child.uid.clone(), grandchildren));
            inserts.push(Operation::Insert(child));
        }
    }

    inserts
}
