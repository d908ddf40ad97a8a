//! Reconciliation of server state with the clean local collection
//!
//! Given the identity listing of everything on the server, the detailed
//! delta changed since the last watermark and the local records that carry
//! no pending edits, [`reconcile`] produces the new authoritative local
//! collection for one resource. Records with pending edits never enter the
//! merge; [`attach_pending`] puts them back afterwards, untouched.
//!
//! Both functions are pure.

use crate::record::{Record, Uid};
use std::collections::{HashMap, HashSet};

/// Merge `server_delta` into `local_clean`, keyed by UID.
///
/// - local records missing from `server_all` (and from the delta) were
///   deleted on the server and are dropped
/// - a delta record strictly newer than its local counterpart replaces it
///   and inherits the local identity
/// - on equal timestamps the local version is kept
/// - delta records without a usable UID are ignored
/// - delta records absent from `server_all` are still accepted
///
/// Local records keep their input order; new delta records follow in
/// delta order.
pub fn reconcile(
    server_all: &[Uid],
    server_delta: &[Record],
    local_clean: &[Record],
) -> Vec<Record> {
    let listed: HashSet<&Uid> = server_all.iter().collect();

    let mut delta_order: Vec<&Uid> = Vec::new();
    let mut delta: HashMap<&Uid, &Record> = HashMap::new();
    for record in server_delta.iter().filter(|r| r.uid.is_valid()) {
        let newer = match delta.get(&record.uid) {
            Some(seen) => seen.last_modified < record.last_modified,
            None => {
                delta_order.push(&record.uid);
                true
            }
        };
        if newer {
            delta.insert(&record.uid, record);
        }
    }

    let mut merged = Vec::with_capacity(local_clean.len() + delta.len());
    let mut matched: HashSet<&Uid> = HashSet::new();

    for local in local_clean {
        if !matched.insert(&local.uid) {
            continue;
        }
        match delta.get(&local.uid) {
            Some(server) if server.last_modified > local.last_modified => {
                let mut updated = (*server).clone();
                updated.local_id = local.local_id;
                merged.push(updated);
            }
            Some(_) => merged.push(local.clone()),
            None if listed.contains(&local.uid) => merged.push(local.clone()),
            None => {}
        }
    }

    for uid in delta_order {
        if matched.contains(uid) {
            continue;
        }
        if let Some(server) = delta.get(uid) {
            merged.push((*server).clone());
        }
    }

    merged
}

/// Re-attach records with pending edits to a merged collection.
///
/// A pending record replaces any merged record with the same UID.
pub fn attach_pending(merged: Vec<Record>, pending: Vec<Record>) -> Vec<Record> {
    let pending_uids: HashSet<Uid> = pending.iter().map(|r| r.uid.clone()).collect();

    let mut result: Vec<Record> = merged
        .into_iter()
        .filter(|r| !pending_uids.contains(&r.uid))
        .collect();
    result.extend(pending);
    result
}
