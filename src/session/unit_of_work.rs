//! Unit of work: commit a session's pending changes in one store
//! transaction.
//!
//! Order of operations inside the transaction:
//!
//! 1. optimistic check of every modified and deleted instance against the
//!    row the store holds now
//! 2. inserts, parents before children
//! 3. updates
//! 4. deletes, children before parents
//!
//! Instance states only change after the store transaction has committed,
//! so a failed commit leaves the session exactly as it was.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::{Catalog, KeyValue, Record};
use crate::session::error::{SessionError, SessionResult};
use crate::session::identity::{IdentityMap, InstanceId, Related, TrackedInstance};
use crate::session::tracker::{invalid_state, same_values, PendingChanges};
use crate::session::Session;
use crate::storage::{StorageError, StoreTransaction};

/// What a successful commit wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// Inserted instances with the keys they were stored under.
    pub inserted: Vec<(InstanceId, KeyValue)>,
    pub updated: Vec<InstanceId>,
    pub deleted: Vec<InstanceId>,
}

impl CommitResult {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Key assigned to an inserted instance.
    pub fn key_of(&self, id: InstanceId) -> Option<&KeyValue> {
        self.inserted.iter().find(|(i, _)| *i == id).map(|(_, k)| k)
    }
}

/// A write that went through, to be reflected on the instance once the
/// transaction is committed.
enum Written {
    Inserted {
        id: InstanceId,
        key: KeyValue,
        row: Record,
    },
    Updated {
        id: InstanceId,
        key: KeyValue,
        row: Record,
    },
    Deleted {
        id: InstanceId,
    },
}

impl Session {
    /// Write every pending change atomically.
    ///
    /// Fails with [`SessionError::ConcurrencyConflict`] when a modified or
    /// deleted row changed in the store since it was fetched, and with
    /// [`SessionError::Commit`] when the store rejects a write. Either way
    /// nothing is written and every instance keeps its state.
    pub fn commit(&mut self) -> SessionResult<CommitResult> {
        self.ensure_open()?;
        let pending = self.map.pending_changes();
        if pending.is_empty() {
            return Ok(CommitResult::default());
        }

        let store = Arc::clone(&self.store);
        let mut tx = store.begin().map_err(SessionError::Commit)?;
        let tx_id = tx.id().to_string();
        tracing::debug!(
            session = %self.id,
            tx = %tx_id,
            added = pending.added.len(),
            modified = pending.modified.len(),
            deleted = pending.deleted.len(),
            "committing"
        );

        let written = match write_batch(&self.map, &self.catalog, tx.as_mut(), &pending) {
            Ok(written) => written,
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(tx = %tx_id, error = %rollback, "rollback failed");
                }
                match &e {
                    SessionError::ConcurrencyConflict { record_type, key } => {
                        tracing::warn!(session = %self.id, record_type = %record_type, key = %key, "concurrency conflict, batch discarded");
                    }
                    other => {
                        tracing::warn!(session = %self.id, error = %other, "commit rolled back");
                    }
                }
                return Err(e);
            }
        };
        tx.commit().map_err(|e| {
            tracing::warn!(session = %self.id, tx = %tx_id, error = %e, "store commit failed");
            SessionError::Commit(e)
        })?;

        let result = self.settle(written);
        tracing::info!(
            session = %self.id,
            tx = %tx_id,
            inserted = result.inserted.len(),
            updated = result.updated.len(),
            deleted = result.deleted.len(),
            "commit complete"
        );
        Ok(result)
    }

    /// Move instances to their post-commit states.
    fn settle(&mut self, written: Vec<Written>) -> CommitResult {
        let mut result = CommitResult::default();
        for write in written {
            match write {
                Written::Inserted { id, key, row } => {
                    self.map.bind_key(id, &key);
                    if let Some(instance) = self.map.get_mut(id) {
                        instance.settle(key.clone(), row);
                    }
                    result.inserted.push((id, key));
                }
                Written::Updated { id, key, row } => {
                    if let Some(instance) = self.map.get_mut(id) {
                        instance.settle(key, row);
                    }
                    result.updated.push(id);
                }
                Written::Deleted { id } => {
                    self.map.evict(id);
                    result.deleted.push(id);
                }
            }
        }

        // deleted instances must not linger in other instances' associations
        if !result.deleted.is_empty() {
            let gone: HashSet<InstanceId> = result.deleted.iter().copied().collect();
            let tracked: Vec<InstanceId> = self.map.tracked().collect();
            for id in tracked {
                let Some(instance) = self.map.get_mut(id) else {
                    continue;
                };
                for related in instance.associations.values_mut() {
                    match related {
                        Related::Many(children) => children.retain(|c| !gone.contains(c)),
                        Related::One(parent) => {
                            if parent.map_or(false, |p| gone.contains(&p)) {
                                *parent = None;
                            }
                        }
                    }
                }
            }
        }
        result
    }
}

fn tracked<'m>(map: &'m IdentityMap, id: InstanceId) -> SessionResult<&'m TrackedInstance> {
    map.get(id).ok_or(SessionError::UnknownInstance(id))
}

fn stored_key(instance: &TrackedInstance, id: InstanceId) -> SessionResult<KeyValue> {
    instance
        .key()
        .cloned()
        .ok_or_else(|| invalid_state(instance, id, "write keyless"))
}

/// Current values with deferred links resolved.
fn outgoing_row(
    map: &IdentityMap,
    instance: &TrackedInstance,
    id: InstanceId,
    assigned: &HashMap<InstanceId, KeyValue>,
) -> SessionResult<Record> {
    let mut row = instance.current().clone();
    for link in &instance.links {
        let parent = tracked(map, link.parent)?;
        let key = assigned
            .get(&link.parent)
            .or_else(|| parent.key())
            .ok_or_else(|| {
                tracing::debug!(child = %id, association = %link.association, "linked parent has no key");
                invalid_state(parent, link.parent, "link to unsaved")
            })?;
        row.insert(link.foreign_key.clone(), key.to_value());
    }
    Ok(row)
}

/// Read back what the store holds after a write, defaults included.
fn read_back(
    tx: &mut (dyn StoreTransaction + '_),
    record_type: &str,
    key: &KeyValue,
) -> SessionResult<Record> {
    tx.fetch_by_key(record_type, key)
        .map_err(SessionError::Commit)?
        .ok_or_else(|| {
            SessionError::Commit(StorageError::RowNotFound {
                collection: record_type.to_string(),
                key: key.clone(),
            })
        })
}

fn write_batch(
    map: &IdentityMap,
    catalog: &Catalog,
    tx: &mut (dyn StoreTransaction + '_),
    pending: &PendingChanges,
) -> SessionResult<Vec<Written>> {
    for &id in pending.modified.iter().chain(&pending.deleted) {
        let instance = tracked(map, id)?;
        let record_type = catalog.describe(instance.record_type())?;
        let key = stored_key(instance, id)?;
        let current = tx
            .fetch_by_key(&record_type.name, &key)
            .map_err(SessionError::Commit)?;
        let untouched = match (current.as_ref(), instance.original()) {
            (Some(row), Some(original)) => same_values(record_type, original, row),
            _ => false,
        };
        if !untouched {
            return Err(SessionError::ConcurrencyConflict {
                record_type: record_type.name.clone(),
                key,
            });
        }
    }

    let mut written = Vec::with_capacity(pending.len());
    let mut assigned = HashMap::new();

    let mut inserts = pending.added.clone();
    inserts.sort_by_cached_key(|id| {
        let rank = map
            .get(*id)
            .map(|i| catalog.rank(i.record_type()))
            .unwrap_or(usize::MAX);
        (rank, *id)
    });
    for id in inserts {
        let instance = tracked(map, id)?;
        let record_type = instance.record_type();
        let row = outgoing_row(map, instance, id, &assigned)?;
        let key = tx.insert(record_type, row).map_err(SessionError::Commit)?;
        let row = read_back(tx, record_type, &key)?;
        assigned.insert(id, key.clone());
        written.push(Written::Inserted { id, key, row });
    }

    for &id in &pending.modified {
        let instance = tracked(map, id)?;
        let record_type = instance.record_type();
        let key = stored_key(instance, id)?;
        let row = outgoing_row(map, instance, id, &assigned)?;
        tx.update(record_type, &key, row)
            .map_err(SessionError::Commit)?;
        let row = read_back(tx, record_type, &key)?;
        written.push(Written::Updated { id, key, row });
    }

    let mut deletes = pending.deleted.clone();
    deletes.sort_by_cached_key(|id| {
        let rank = map
            .get(*id)
            .map(|i| catalog.rank(i.record_type()))
            .unwrap_or(0);
        (std::cmp::Reverse(rank), *id)
    });
    for id in deletes {
        let instance = tracked(map, id)?;
        let key = stored_key(instance, id)?;
        tx.delete(instance.record_type(), &key)
            .map_err(SessionError::Commit)?;
        written.push(Written::Deleted { id });
    }

    Ok(written)
}
