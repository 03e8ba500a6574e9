//! Identity map: one tracked instance per (record type, primary key).
//!
//! Instances live in an arena owned by the session and are addressed by
//! [`InstanceId`]. Associations between instances are held as ids, never as
//! references, so the record graph can be cyclic at the type level without
//! any ownership cycles in memory.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::catalog::{KeyValue, Record};

/// Handle to a tracked instance within one session.
///
/// Two handles are equal exactly when they name the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Current values equal the values fetched.
    Unchanged,
    /// At least one field differs from the values fetched.
    Modified,
    /// Registered by the caller, not yet inserted.
    Added,
    /// Marked for removal at the next commit.
    Deleted,
    /// No longer tracked. Terminal.
    Detached,
}

impl LifecycleState {
    /// Whether the instance still takes part in change tracking.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, LifecycleState::Detached)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unchanged => "unchanged",
            LifecycleState::Modified => "modified",
            LifecycleState::Added => "added",
            LifecycleState::Deleted => "deleted",
            LifecycleState::Detached => "detached",
        };
        f.write_str(name)
    }
}

/// A resolved association, cached on its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    One(Option<InstanceId>),
    Many(Vec<InstanceId>),
}

/// A foreign key waiting for its parent's store-generated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingLink {
    pub association: String,
    pub foreign_key: String,
    pub parent: InstanceId,
}

/// A record under change tracking.
#[derive(Debug, Clone)]
pub struct TrackedInstance {
    record_type: String,
    key: Option<KeyValue>,
    /// values as fetched; `None` for added instances
    original: Option<Record>,
    current: Record,
    state: LifecycleState,
    pub(crate) associations: HashMap<String, Related>,
    pub(crate) links: Vec<PendingLink>,
}

impl TrackedInstance {
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Primary key. Added instances with a store-generated key have none
    /// until committed.
    pub fn key(&self) -> Option<&KeyValue> {
        self.key.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn original(&self) -> Option<&Record> {
        self.original.as_ref()
    }

    pub fn current(&self) -> &Record {
        &self.current
    }

    /// Current value of a field; absent fields read as null.
    pub fn get(&self, field: &str) -> &Value {
        crate::catalog::field_value(&self.current, field)
    }

    /// Whether an association is already resolved on this instance.
    pub fn is_loaded(&self, association: &str) -> bool {
        self.associations.contains_key(association)
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn current_mut(&mut self) -> &mut Record {
        &mut self.current
    }

    /// Accept `row` as the stored state after a successful write.
    pub(crate) fn settle(&mut self, key: KeyValue, row: Record) {
        self.key = Some(key);
        self.original = Some(row.clone());
        self.current = row;
        self.links.clear();
        self.state = LifecycleState::Unchanged;
    }
}

/// Per-session arena of tracked instances with a (type, key) index.
#[derive(Debug, Default)]
pub struct IdentityMap {
    slots: Vec<TrackedInstance>,
    index: HashMap<(String, KeyValue), InstanceId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live instance for `(record_type, key)`, if tracked.
    pub fn lookup(&self, record_type: &str, key: &KeyValue) -> Option<InstanceId> {
        self.index
            .get(&(record_type.to_string(), key.clone()))
            .copied()
    }

    /// Return the tracked instance for `(record_type, key)`, or call
    /// `loader` and track what it returns as `Unchanged`. `Ok(None)` means
    /// the loader found nothing.
    pub fn get_or_create<E>(
        &mut self,
        record_type: &str,
        key: &KeyValue,
        loader: impl FnOnce() -> Result<Option<Record>, E>,
    ) -> Result<Option<InstanceId>, E> {
        if let Some(id) = self.lookup(record_type, key) {
            return Ok(Some(id));
        }
        Ok(loader()?.map(|record| self.track_fetched(record_type, key, record)))
    }

    /// Track a fetched row, unless an instance for its key already exists.
    /// The existing instance wins; its pending edits are kept.
    pub(crate) fn track_fetched(
        &mut self,
        record_type: &str,
        key: &KeyValue,
        record: Record,
    ) -> InstanceId {
        if let Some(id) = self.lookup(record_type, key) {
            return id;
        }
        let id = self.push(TrackedInstance {
            record_type: record_type.to_string(),
            key: Some(key.clone()),
            original: Some(record.clone()),
            current: record,
            state: LifecycleState::Unchanged,
            associations: HashMap::new(),
            links: Vec::new(),
        });
        self.index.insert((record_type.to_string(), key.clone()), id);
        id
    }

    /// Track a caller-built instance as `Added`, bypassing any loader.
    /// Fails with the id of the instance already tracked under `key`.
    pub fn register(
        &mut self,
        record_type: &str,
        key: Option<KeyValue>,
        record: Record,
    ) -> Result<InstanceId, InstanceId> {
        if let Some(existing) = key.as_ref().and_then(|k| self.lookup(record_type, k)) {
            return Err(existing);
        }
        let id = self.push(TrackedInstance {
            record_type: record_type.to_string(),
            key: key.clone(),
            original: None,
            current: record,
            state: LifecycleState::Added,
            associations: HashMap::new(),
            links: Vec::new(),
        });
        if let Some(key) = key {
            self.index.insert((record_type.to_string(), key), id);
        }
        Ok(id)
    }

    /// Move an instance to a new key, dropping its old index entry. Fails
    /// with the id of another instance already tracked under `key`.
    pub(crate) fn rekey(&mut self, id: InstanceId, key: Option<KeyValue>) -> Result<(), InstanceId> {
        let Some(instance) = self.slots.get(id.0) else {
            return Ok(());
        };
        let record_type = instance.record_type.clone();
        if let Some(other) = key.as_ref().and_then(|k| self.lookup(&record_type, k)) {
            if other != id {
                return Err(other);
            }
        }
        self.unindex(id);
        if let Some(instance) = self.slots.get_mut(id.0) {
            instance.key = key.clone();
        }
        if let Some(key) = key {
            self.index.insert((record_type, key), id);
        }
        Ok(())
    }

    /// Remove the index entry for an instance's current key, if it is the
    /// one indexed there.
    fn unindex(&mut self, id: InstanceId) {
        let Some(instance) = self.slots.get(id.0) else {
            return;
        };
        if let Some(key) = instance.key.clone() {
            let index_key = (instance.record_type.clone(), key);
            if self.index.get(&index_key) == Some(&id) {
                self.index.remove(&index_key);
            }
        }
    }

    /// Stop tracking an instance. It stays readable through its id but is
    /// `Detached` from now on.
    pub fn evict(&mut self, id: InstanceId) {
        self.unindex(id);
        let Some(instance) = self.slots.get_mut(id.0) else {
            return;
        };
        instance.state = LifecycleState::Detached;
        instance.associations.clear();
        instance.links.clear();
    }

    /// Detach every instance.
    pub fn clear(&mut self) {
        for instance in &mut self.slots {
            instance.state = LifecycleState::Detached;
            instance.links.clear();
        }
        self.index.clear();
    }

    /// Index an instance under the key the store assigned it.
    pub(crate) fn bind_key(&mut self, id: InstanceId, key: &KeyValue) {
        self.unindex(id);
        if let Some(instance) = self.slots.get_mut(id.0) {
            instance.key = Some(key.clone());
            self.index
                .insert((instance.record_type.clone(), key.clone()), id);
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<&TrackedInstance> {
        self.slots.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut TrackedInstance> {
        self.slots.get_mut(id.0)
    }

    /// Ids of every instance not yet detached, in registration order.
    pub fn tracked(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state.is_tracked())
            .map(|(n, _)| InstanceId(n))
    }

    /// Number of instances not yet detached.
    pub fn len(&self) -> usize {
        self.tracked().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, instance: TrackedInstance) -> InstanceId {
        self.slots.push(instance);
        InstanceId(self.slots.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, name: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), json!(id));
        r.insert("name".into(), json!(name));
        r
    }

    #[test]
    fn test_get_or_create_loads_once() {
        let mut map = IdentityMap::new();
        let mut loads = 0;
        let key = KeyValue::Int(1);

        let first = map
            .get_or_create::<()>("customer", &key, || {
                loads += 1;
                Ok(Some(row(1, "Ann")))
            })
            .unwrap()
            .unwrap();
        let second = map
            .get_or_create::<()>("customer", &key, || {
                loads += 1;
                Ok(Some(row(1, "other")))
            })
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(loads, 1);
        assert_eq!(map.get(first).unwrap().get("name"), &json!("Ann"));
        assert_eq!(map.get(first).unwrap().state(), LifecycleState::Unchanged);
    }

    #[test]
    fn test_same_key_different_types() {
        let mut map = IdentityMap::new();
        let key = KeyValue::Int(1);
        let a = map
            .get_or_create::<()>("customer", &key, || Ok(Some(row(1, "a"))))
            .unwrap();
        let b = map
            .get_or_create::<()>("product", &key, || Ok(Some(row(1, "b"))))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_row() {
        let mut map = IdentityMap::new();
        let found = map
            .get_or_create::<()>("customer", &KeyValue::Int(9), || Ok(None))
            .unwrap();
        assert!(found.is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_register_and_evict() {
        let mut map = IdentityMap::new();
        let id = map.register("customer", None, row(0, "new")).unwrap();
        assert_eq!(map.get(id).unwrap().state(), LifecycleState::Added);
        assert!(map.get(id).unwrap().key().is_none());

        map.bind_key(id, &KeyValue::Int(4));
        assert_eq!(map.lookup("customer", &KeyValue::Int(4)), Some(id));
        assert_eq!(
            map.register("customer", Some(KeyValue::Int(4)), row(4, "dup")),
            Err(id)
        );

        map.evict(id);
        assert_eq!(map.get(id).unwrap().state(), LifecycleState::Detached);
        assert_eq!(map.lookup("customer", &KeyValue::Int(4)), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_bind_key_drops_stale_entry() {
        let mut map = IdentityMap::new();
        let id = map
            .register("customer", Some(KeyValue::Int(1)), row(1, "new"))
            .unwrap();

        map.bind_key(id, &KeyValue::Int(7));
        assert_eq!(map.lookup("customer", &KeyValue::Int(1)), None);
        assert_eq!(map.lookup("customer", &KeyValue::Int(7)), Some(id));
    }
}
