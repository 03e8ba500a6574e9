//! In-process store.
//!
//! All state lives behind one `RwLock`. A transaction holds the writer mutex
//! for its whole life, works on a private copy of the state and swaps it in
//! on commit, so readers never observe a half-applied batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::catalog::{KeyValue, Record};
use crate::storage::constraints::{self, RowSource};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fetch::{apply_request, FetchRequest};
use crate::storage::types::{HistoryEntry, PhysicalSchema, SchemaChange};
use crate::storage::{Store, StoreCapabilities, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct State {
    schema: PhysicalSchema,
    rows: BTreeMap<String, BTreeMap<KeyValue, Record>>,
    sequences: BTreeMap<String, i64>,
    history: Vec<HistoryEntry>,
}

impl State {
    fn collection(&self, name: &str) -> StorageResult<&BTreeMap<KeyValue, Record>> {
        self.rows
            .get(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> StorageResult<&mut BTreeMap<KeyValue, Record>> {
        self.rows
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))
    }
}

impl RowSource for State {
    fn contains(&mut self, collection: &str, key: &KeyValue) -> StorageResult<bool> {
        Ok(self.collection(collection)?.contains_key(key))
    }

    fn rows(&mut self, collection: &str) -> StorageResult<Vec<Record>> {
        Ok(self.collection(collection)?.values().cloned().collect())
    }
}

/// Snapshot of a [`MemoryStore`]'s call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub fetch_by_key: usize,
    pub fetch_by_predicate: usize,
    pub transactions: usize,
    pub commits: usize,
}

impl StoreStats {
    /// Non-transactional fetches of either kind.
    pub fn fetches(&self) -> usize {
        self.fetch_by_key + self.fetch_by_predicate
    }
}

#[derive(Debug, Default)]
struct Counters {
    fetch_by_key: AtomicUsize,
    fetch_by_predicate: AtomicUsize,
    transactions: AtomicUsize,
    commits: AtomicUsize,
}

/// A store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    writer: Mutex<()>,
    migration_lock: Mutex<Option<String>>,
    capabilities: StoreCapabilities,
    counters: Counters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that only evaluates the given query constructs.
    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            fetch_by_key: self.counters.fetch_by_key.load(Ordering::Relaxed),
            fetch_by_predicate: self.counters.fetch_by_predicate.load(Ordering::Relaxed),
            transactions: self.counters.transactions.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.fetch_by_key.store(0, Ordering::Relaxed);
        self.counters.fetch_by_predicate.store(0, Ordering::Relaxed);
        self.counters.transactions.store(0, Ordering::Relaxed);
        self.counters.commits.store(0, Ordering::Relaxed);
    }

    /// Number of committed rows in a collection.
    pub fn row_count(&self, collection: &str) -> StorageResult<usize> {
        Ok(self.state.read().collection(collection)?.len())
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    fn fetch_by_key(&self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>> {
        self.counters.fetch_by_key.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state.collection(collection)?.get(key).cloned())
    }

    fn fetch_by_predicate(
        &self,
        collection: &str,
        request: &FetchRequest,
    ) -> StorageResult<Vec<Record>> {
        self.counters.fetch_by_predicate.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        let rows = state.collection(collection)?.values().cloned();
        Ok(apply_request(rows, request))
    }

    fn begin(&self) -> StorageResult<Box<dyn StoreTransaction + '_>> {
        let guard = self.writer.lock();
        let working = self.state.read().clone();
        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            id: ulid::Ulid::new().to_string(),
            store: self,
            working,
            _writer: guard,
        }))
    }

    fn read_migration_history(&self) -> StorageResult<Vec<HistoryEntry>> {
        Ok(self.state.read().history.clone())
    }

    fn physical_schema(&self) -> StorageResult<PhysicalSchema> {
        Ok(self.state.read().schema.clone())
    }

    fn try_lock_migrations(&self, owner: &str) -> StorageResult<()> {
        let mut lock = self.migration_lock.lock();
        match lock.as_deref() {
            Some(holder) => Err(StorageError::MigrationLocked {
                holder: holder.to_string(),
            }),
            None => {
                *lock = Some(owner.to_string());
                Ok(())
            }
        }
    }

    fn unlock_migrations(&self, owner: &str) -> StorageResult<()> {
        let mut lock = self.migration_lock.lock();
        if lock.as_deref() != Some(owner) {
            return Err(StorageError::LockNotHeld {
                owner: owner.to_string(),
            });
        }
        *lock = None;
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    id: String,
    store: &'a MemoryStore,
    working: State,
    _writer: MutexGuard<'a, ()>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch_by_key(&mut self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>> {
        Ok(self.working.collection(collection)?.get(key).cloned())
    }

    fn insert(&mut self, collection: &str, record: Record) -> StorageResult<KeyValue> {
        let shape = constraints::shape(&self.working.schema, collection)?.clone();
        let sequence = self.working.sequences.entry(collection.to_string()).or_default();
        let (key, record) = constraints::prepare_insert(&shape, record, sequence)?;

        if self.working.contains(collection, &key)? {
            return Err(StorageError::DuplicateKey {
                collection: collection.to_string(),
                key,
            });
        }
        constraints::check_references(&shape, &record, &mut self.working)?;

        self.working
            .collection_mut(collection)?
            .insert(key.clone(), record);
        Ok(key)
    }

    fn update(&mut self, collection: &str, key: &KeyValue, record: Record) -> StorageResult<()> {
        let shape = constraints::shape(&self.working.schema, collection)?.clone();
        if !self.working.contains(collection, key)? {
            return Err(StorageError::RowNotFound {
                collection: collection.to_string(),
                key: key.clone(),
            });
        }

        let mut record = constraints::normalize_row(&shape, record)?;
        record.insert(shape.primary_key.clone(), key.to_value());
        constraints::check_references(&shape, &record, &mut self.working)?;

        self.working
            .collection_mut(collection)?
            .insert(key.clone(), record);
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &KeyValue) -> StorageResult<()> {
        if !self.working.contains(collection, key)? {
            return Err(StorageError::RowNotFound {
                collection: collection.to_string(),
                key: key.clone(),
            });
        }
        let schema = self.working.schema.clone();
        constraints::check_not_referenced(&schema, collection, key, &mut self.working)?;
        self.working.collection_mut(collection)?.remove(key);
        Ok(())
    }

    fn alter(&mut self, change: &SchemaChange) -> StorageResult<()> {
        if self.working.schema.contains_key(change.collection()) {
            constraints::check_change_rows(change, &mut self.working)?;
        }
        change.apply_to(&mut self.working.schema)?;

        match change {
            SchemaChange::CreateCollection { shape } => {
                self.working.rows.insert(shape.name.clone(), BTreeMap::new());
            }
            SchemaChange::DropCollection { shape } => {
                self.working.rows.remove(&shape.name);
                self.working.sequences.remove(&shape.name);
            }
            _ => {
                for row in self.working.collection_mut(change.collection())?.values_mut() {
                    constraints::migrate_row(change, row);
                }
            }
        }
        Ok(())
    }

    fn append_migration_history(&mut self, entry: HistoryEntry) -> StorageResult<()> {
        self.working.history.push(entry);
        Ok(())
    }

    fn remove_migration_history(&mut self, step_id: &str) -> StorageResult<()> {
        match self.working.history.last() {
            Some(last) if last.step_id == step_id => {
                self.working.history.pop();
                Ok(())
            }
            _ => Err(StorageError::HistoryMismatch(step_id.to_string())),
        }
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        let this = *self;
        *this.store.state.write() = this.working;
        this.store.counters.commits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tx = %this.id, store = "memory", "transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StorageResult<()> {
        tracing::debug!(tx = %self.id, store = "memory", "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, FieldDef};
    use crate::query::Predicate;
    use crate::storage::types::{CollectionShape, ForeignKeyRef, KeyGeneration};
    use serde_json::json;

    fn setup() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.alter(&SchemaChange::CreateCollection {
            shape: CollectionShape {
                name: "customer".into(),
                fields: vec![
                    FieldDef::new("id", DataType::Integer),
                    FieldDef::required("name", DataType::Text),
                ],
                primary_key: "id".into(),
                key_generation: Some(KeyGeneration::Sequence),
                references: vec![],
            },
        })
        .unwrap();
        tx.alter(&SchemaChange::CreateCollection {
            shape: CollectionShape {
                name: "order".into(),
                fields: vec![
                    FieldDef::new("id", DataType::Integer),
                    FieldDef::required("qty", DataType::Integer),
                    FieldDef::new("customer_id", DataType::Integer),
                ],
                primary_key: "id".into(),
                key_generation: Some(KeyGeneration::Sequence),
                references: vec![ForeignKeyRef::new("customer_id", "customer")],
            },
        })
        .unwrap();
        tx.commit().unwrap();
        store
    }

    fn row(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_insert_assigns_keys() {
        let store = setup();
        let mut tx = store.begin().unwrap();
        let a = tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        let b = tx.insert("customer", row(json!({"name": "Bob"}))).unwrap();
        tx.commit().unwrap();

        assert_eq!(a, KeyValue::Int(1));
        assert_eq!(b, KeyValue::Int(2));
        let ann = store.fetch_by_key("customer", &a).unwrap().unwrap();
        assert_eq!(ann["id"], json!(1));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = setup();
        let mut tx = store.begin().unwrap();
        tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.row_count("customer").unwrap(), 0);

        {
            let mut tx = store.begin().unwrap();
            tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        }
        assert_eq!(store.row_count("customer").unwrap(), 0);
    }

    #[test]
    fn test_referential_integrity() {
        let store = setup();
        let mut tx = store.begin().unwrap();
        let dangling = tx.insert("order", row(json!({"qty": 1, "customer_id": 7})));
        assert!(matches!(
            dangling,
            Err(StorageError::ForeignKeyViolation { .. })
        ));

        let c = tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.insert("order", row(json!({"qty": 1, "customer_id": 1})))
            .unwrap();
        assert!(matches!(
            tx.delete("customer", &c),
            Err(StorageError::StillReferenced { .. })
        ));
    }

    #[test]
    fn test_fetch_by_predicate_and_stats() {
        let store = setup();
        let mut tx = store.begin().unwrap();
        for name in ["Ann", "Bob", "Cid"] {
            tx.insert("customer", row(json!({ "name": name }))).unwrap();
        }
        tx.commit().unwrap();
        store.reset_stats();

        let found = store
            .fetch_by_predicate("customer", &FetchRequest::filtered(Predicate::like("name", "%b")))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], json!("Bob"));
        store.fetch_by_key("customer", &KeyValue::Int(1)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.fetch_by_predicate, 1);
        assert_eq!(stats.fetch_by_key, 1);
        assert_eq!(stats.fetches(), 2);
    }

    #[test]
    fn test_alter_rewrites_rows() {
        let store = setup();
        let mut tx = store.begin().unwrap();
        tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.alter(&SchemaChange::AddField {
            collection: "customer".into(),
            field: FieldDef::new("tier", DataType::Text).with_default(json!("basic")),
        })
        .unwrap();
        tx.commit().unwrap();

        let ann = store.fetch_by_key("customer", &KeyValue::Int(1)).unwrap().unwrap();
        assert_eq!(ann["tier"], json!("basic"));
        assert!(store.physical_schema().unwrap()["customer"].field("tier").is_some());
    }

    #[test]
    fn test_migration_lock() {
        let store = MemoryStore::new();
        store.try_lock_migrations("a").unwrap();
        assert!(matches!(
            store.try_lock_migrations("b"),
            Err(StorageError::MigrationLocked { holder }) if holder == "a"
        ));
        assert!(store.unlock_migrations("b").is_err());
        store.unlock_migrations("a").unwrap();
        store.try_lock_migrations("b").unwrap();
    }

    #[test]
    fn test_history_removal_must_be_last() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.append_migration_history(HistoryEntry::new("001", "x")).unwrap();
        tx.append_migration_history(HistoryEntry::new("002", "y")).unwrap();
        assert!(tx.remove_migration_history("001").is_err());
        tx.remove_migration_history("002").unwrap();
        tx.commit().unwrap();
        let history = store.read_migration_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step_id, "001");
    }
}
