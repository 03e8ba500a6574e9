//! Git-backed store.
//!
//! Repository layout on `main`:
//!
//! ```text
//! /
//! ├── {collection}/{key}.json     one blob per row
//! ├── _schema/{collection}.json   collection shapes
//! ├── _sequences/{collection}.json  last issued integer key
//! └── _migrations/history.json    applied migration steps
//! ```
//!
//! A store transaction buffers its writes in memory and publishes them as a
//! single commit. Main only moves by compare-and-swap from the commit the
//! transaction started on, so a writer in another process that got there
//! first turns this commit into a `ConcurrentModification` error and nothing
//! is published.

mod blob;
mod commit;
mod refs;
mod tree;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{Oid, Repository, Tree};
use parking_lot::{Mutex, MutexGuard};

pub use commit::GitSignature;

use self::blob::StoredRow;
use self::commit::CommitSummary;
use crate::catalog::{KeyValue, Record};
use crate::storage::constraints::{self, RowSource};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::fetch::{apply_request, FetchRequest};
use crate::storage::types::{CollectionShape, HistoryEntry, PhysicalSchema, SchemaChange};
use crate::storage::{Store, StoreCapabilities, StoreTransaction};

const SCHEMA_DIR: &str = "_schema";
const SEQUENCE_DIR: &str = "_sequences";
const MIGRATION_DIR: &str = "_migrations";
const HISTORY_FILE: &str = "history.json";

/// A store persisted in a git repository.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct GitStore {
    inner: Arc<Inner>,
}

struct Inner {
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
    /// serializes transactions within this process
    writer: Mutex<()>,
}

impl GitStore {
    /// Open an existing store.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_signature(path, GitSignature::default())
    }

    pub fn open_with_signature(
        path: impl AsRef<Path>,
        signature: GitSignature,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo =
            Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        refs::main_commit(&repo)?;
        Ok(Self::from_repo(repo, path, signature))
    }

    /// Initialize a new, empty store.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init_with_signature(path, GitSignature::default())
    }

    pub fn init_with_signature(
        path: impl AsRef<Path>,
        signature: GitSignature,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;
        let initial = commit::create_initial_commit(&repo, &signature)?;
        refs::init_main(&repo, initial)?;
        tracing::info!(path = %path.display(), "initialized git store");
        Ok(Self::from_repo(repo, path, signature))
    }

    /// Open or initialize a store.
    pub fn open_or_init(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open_with_signature(path, signature)
        } else {
            Self::init_with_signature(path, signature)
        }
    }

    fn from_repo(repo: Repository, path: &Path, signature: GitSignature) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature,
                writer: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Id of the commit main points at.
    pub fn head(&self) -> StorageResult<String> {
        let repo = self.inner.repo.lock();
        Ok(refs::main_commit(&repo)?.to_string())
    }

    /// Run `f` against the tree of `at`, or of main when `None`.
    fn with_tree<T>(
        &self,
        at: Option<Oid>,
        f: impl FnOnce(&Repository, &Tree<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let repo = self.inner.repo.lock();
        let commit = match at {
            Some(id) => id,
            None => refs::main_commit(&repo)?,
        };
        let tree = repo.find_commit(commit)?.tree()?;
        f(&repo, &tree)
    }
}

fn schema_file(collection: &str) -> String {
    format!("{}/{}.json", SCHEMA_DIR, collection)
}

fn require_collection(repo: &Repository, tree: &Tree<'_>, collection: &str) -> StorageResult<()> {
    match tree::read_file(repo, tree, &schema_file(collection))? {
        Some(_) => Ok(()),
        None => Err(StorageError::UnknownCollection(collection.to_string())),
    }
}

fn read_schema(repo: &Repository, tree: &Tree<'_>) -> StorageResult<PhysicalSchema> {
    let mut schema = PhysicalSchema::new();
    for (_, id) in tree::list_files(repo, tree, SCHEMA_DIR)? {
        let shape: CollectionShape = blob::parse_json(repo.find_blob(id)?.content())?;
        schema.insert(shape.name.clone(), shape);
    }
    Ok(schema)
}

fn read_history(repo: &Repository, tree: &Tree<'_>) -> StorageResult<Vec<HistoryEntry>> {
    let path = format!("{}/{}", MIGRATION_DIR, HISTORY_FILE);
    match tree::read_file(repo, tree, &path)? {
        Some(bytes) => blob::parse_json(&bytes),
        None => Ok(Vec::new()),
    }
}

fn read_sequence(repo: &Repository, tree: &Tree<'_>, collection: &str) -> StorageResult<i64> {
    let path = format!("{}/{}.json", SEQUENCE_DIR, collection);
    match tree::read_file(repo, tree, &path)? {
        Some(bytes) => blob::parse_json(&bytes),
        None => Ok(0),
    }
}

fn read_row(
    repo: &Repository,
    tree: &Tree<'_>,
    collection: &str,
    key: &KeyValue,
) -> StorageResult<Option<StoredRow>> {
    let path = format!("{}/{}", collection, blob::file_name(key)?);
    tree::read_file(repo, tree, &path)?
        .map(|bytes| blob::deserialize_row(&bytes, &path))
        .transpose()
}

/// Every row of a collection, in key order.
fn read_rows(
    repo: &Repository,
    tree: &Tree<'_>,
    collection: &str,
) -> StorageResult<BTreeMap<KeyValue, StoredRow>> {
    let mut rows = BTreeMap::new();
    for (name, id) in tree::list_files(repo, tree, collection)? {
        let path = format!("{}/{}", collection, name);
        let row = blob::deserialize_row(repo.find_blob(id)?.content(), &path)?;
        rows.insert(row.key.clone(), row);
    }
    Ok(rows)
}

impl Store for GitStore {
    fn name(&self) -> &'static str {
        "git"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::full()
    }

    fn fetch_by_key(&self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>> {
        self.with_tree(None, |repo, tree| {
            require_collection(repo, tree, collection)?;
            Ok(read_row(repo, tree, collection, key)?.map(|row| row.data))
        })
    }

    fn fetch_by_predicate(
        &self,
        collection: &str,
        request: &FetchRequest,
    ) -> StorageResult<Vec<Record>> {
        self.with_tree(None, |repo, tree| {
            require_collection(repo, tree, collection)?;
            let rows = read_rows(repo, tree, collection)?;
            Ok(apply_request(rows.into_values().map(|row| row.data), request))
        })
    }

    fn begin(&self) -> StorageResult<Box<dyn StoreTransaction + '_>> {
        let guard = self.inner.writer.lock();
        let (base, schema, history) = {
            let repo = self.inner.repo.lock();
            let base = refs::main_commit(&repo)?;
            let tree = repo.find_commit(base)?.tree()?;
            (base, read_schema(&repo, &tree)?, read_history(&repo, &tree)?)
        };

        Ok(Box::new(GitTransaction {
            id: ulid::Ulid::new().to_string(),
            store: self,
            _writer: guard,
            base,
            schema,
            history,
            staged: BTreeMap::new(),
            fresh: BTreeSet::new(),
            sequences: BTreeMap::new(),
            schema_dirty: false,
            history_dirty: false,
            summary: CommitSummary::default(),
        }))
    }

    fn read_migration_history(&self) -> StorageResult<Vec<HistoryEntry>> {
        self.with_tree(None, read_history)
    }

    fn physical_schema(&self) -> StorageResult<PhysicalSchema> {
        self.with_tree(None, read_schema)
    }

    fn try_lock_migrations(&self, owner: &str) -> StorageResult<()> {
        let repo = self.inner.repo.lock();
        refs::acquire_lock(&repo, owner, &self.inner.signature)
    }

    fn unlock_migrations(&self, owner: &str) -> StorageResult<()> {
        let repo = self.inner.repo.lock();
        refs::release_lock(&repo, owner)
    }
}

struct GitTransaction<'a> {
    id: String,
    store: &'a GitStore,
    _writer: MutexGuard<'a, ()>,
    /// main when the transaction began
    base: Oid,
    schema: PhysicalSchema,
    history: Vec<HistoryEntry>,
    /// `None` marks a deleted row
    staged: BTreeMap<String, BTreeMap<KeyValue, Option<StoredRow>>>,
    /// collections created in this transaction; their base content is ignored
    fresh: BTreeSet<String>,
    sequences: BTreeMap<String, i64>,
    schema_dirty: bool,
    history_dirty: bool,
    summary: CommitSummary,
}

impl GitTransaction<'_> {
    fn check_collection(&self, collection: &str) -> StorageResult<()> {
        if self.schema.contains_key(collection) {
            Ok(())
        } else {
            Err(StorageError::UnknownCollection(collection.to_string()))
        }
    }

    fn visible_row(&self, collection: &str, key: &KeyValue) -> StorageResult<Option<StoredRow>> {
        self.check_collection(collection)?;
        if let Some(staged) = self.staged.get(collection).and_then(|rows| rows.get(key)) {
            return Ok(staged.clone());
        }
        if self.fresh.contains(collection) {
            return Ok(None);
        }
        self.store
            .with_tree(Some(self.base), |repo, tree| read_row(repo, tree, collection, key))
    }

    fn visible_rows(&self, collection: &str) -> StorageResult<BTreeMap<KeyValue, StoredRow>> {
        self.check_collection(collection)?;
        let mut rows = if self.fresh.contains(collection) {
            BTreeMap::new()
        } else {
            self.store
                .with_tree(Some(self.base), |repo, tree| read_rows(repo, tree, collection))?
        };
        for (key, staged) in self.staged.get(collection).into_iter().flatten() {
            match staged {
                Some(row) => rows.insert(key.clone(), row.clone()),
                None => rows.remove(key),
            };
        }
        Ok(rows)
    }

    fn sequence(&mut self, collection: &str) -> StorageResult<i64> {
        if let Some(&n) = self.sequences.get(collection) {
            return Ok(n);
        }
        let n = if self.fresh.contains(collection) {
            0
        } else {
            self.store.with_tree(Some(self.base), |repo, tree| {
                read_sequence(repo, tree, collection)
            })?
        };
        self.sequences.insert(collection.to_string(), n);
        Ok(n)
    }

    fn stage(&mut self, collection: &str, key: KeyValue, row: Option<StoredRow>) {
        self.staged
            .entry(collection.to_string())
            .or_default()
            .insert(key, row);
    }
}

impl RowSource for GitTransaction<'_> {
    fn contains(&mut self, collection: &str, key: &KeyValue) -> StorageResult<bool> {
        Ok(self.visible_row(collection, key)?.is_some())
    }

    fn rows(&mut self, collection: &str) -> StorageResult<Vec<Record>> {
        Ok(self
            .visible_rows(collection)?
            .into_values()
            .map(|row| row.data)
            .collect())
    }
}

impl StoreTransaction for GitTransaction<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch_by_key(&mut self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>> {
        Ok(self.visible_row(collection, key)?.map(|row| row.data))
    }

    fn insert(&mut self, collection: &str, record: Record) -> StorageResult<KeyValue> {
        let shape = constraints::shape(&self.schema, collection)?.clone();
        let mut sequence = self.sequence(collection)?;
        let (key, record) = constraints::prepare_insert(&shape, record, &mut sequence)?;
        blob::file_name(&key)?;

        if self.visible_row(collection, &key)?.is_some() {
            return Err(StorageError::DuplicateKey {
                collection: collection.to_string(),
                key,
            });
        }
        constraints::check_references(&shape, &record, self)?;

        self.sequences.insert(collection.to_string(), sequence);
        self.stage(collection, key.clone(), Some(StoredRow::new(key.clone(), record)));
        self.summary.inserts += 1;
        Ok(key)
    }

    fn update(&mut self, collection: &str, key: &KeyValue, record: Record) -> StorageResult<()> {
        let shape = constraints::shape(&self.schema, collection)?.clone();
        let existing = self
            .visible_row(collection, key)?
            .ok_or_else(|| StorageError::RowNotFound {
                collection: collection.to_string(),
                key: key.clone(),
            })?;

        let mut record = constraints::normalize_row(&shape, record)?;
        record.insert(shape.primary_key.clone(), key.to_value());
        constraints::check_references(&shape, &record, self)?;

        self.stage(collection, key.clone(), Some(existing.with_update(record)));
        self.summary.updates += 1;
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &KeyValue) -> StorageResult<()> {
        if self.visible_row(collection, key)?.is_none() {
            return Err(StorageError::RowNotFound {
                collection: collection.to_string(),
                key: key.clone(),
            });
        }
        let schema = self.schema.clone();
        constraints::check_not_referenced(&schema, collection, key, self)?;

        self.stage(collection, key.clone(), None);
        self.summary.deletes += 1;
        Ok(())
    }

    fn alter(&mut self, change: &SchemaChange) -> StorageResult<()> {
        if self.schema.contains_key(change.collection()) {
            constraints::check_change_rows(change, self)?;
        }
        change.apply_to(&mut self.schema)?;

        match change {
            SchemaChange::CreateCollection { shape } => {
                self.fresh.insert(shape.name.clone());
                self.staged.remove(&shape.name);
                self.sequences.insert(shape.name.clone(), 0);
            }
            SchemaChange::DropCollection { shape } => {
                self.staged.remove(&shape.name);
                self.sequences.remove(&shape.name);
            }
            SchemaChange::AddField { collection, .. } | SchemaChange::DropField { collection, .. } => {
                for (key, row) in self.visible_rows(collection)? {
                    let mut data = row.data.clone();
                    constraints::migrate_row(change, &mut data);
                    self.stage(collection, key, Some(row.with_update(data)));
                }
            }
            SchemaChange::AddReference { .. } | SchemaChange::DropReference { .. } => {}
        }

        self.schema_dirty = true;
        self.summary.schema_changes.push(change.to_string());
        Ok(())
    }

    fn append_migration_history(&mut self, entry: HistoryEntry) -> StorageResult<()> {
        self.summary.history.push(format!("applied {}", entry.step_id));
        self.history.push(entry);
        self.history_dirty = true;
        Ok(())
    }

    fn remove_migration_history(&mut self, step_id: &str) -> StorageResult<()> {
        match self.history.last() {
            Some(last) if last.step_id == step_id => {
                self.history.pop();
                self.history_dirty = true;
                self.summary.history.push(format!("reverted {}", step_id));
                Ok(())
            }
            _ => Err(StorageError::HistoryMismatch(step_id.to_string())),
        }
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        let tx = *self;
        if tx.summary.is_empty() {
            tracing::debug!(tx = %tx.id, "empty transaction, nothing to commit");
            return Ok(());
        }

        let repo = tx.store.inner.repo.lock();
        let base_tree = repo.find_commit(tx.base)?.tree()?;
        let mut mutator = tree::TreeMutator::from_tree(&repo, &base_tree)?;

        for dir in tree::list_collection_dirs(&base_tree) {
            if !tx.schema.contains_key(&dir) {
                mutator.remove_dir(&dir)?;
                mutator.remove(SEQUENCE_DIR, &format!("{}.json", dir))?;
            }
        }
        for name in tx.fresh.iter().filter(|c| tx.schema.contains_key(*c)) {
            mutator.reset_dir(name)?;
        }

        for (collection, rows) in &tx.staged {
            if !tx.schema.contains_key(collection) {
                continue;
            }
            for (key, row) in rows {
                let file = blob::file_name(key)?;
                match row {
                    Some(row) => {
                        let id = repo.blob(&blob::serialize_row(row)?)?;
                        mutator.put(collection, &file, id)?;
                    }
                    None => mutator.remove(collection, &file)?,
                }
            }
        }

        if tx.schema_dirty {
            mutator.reset_dir(SCHEMA_DIR)?;
            for shape in tx.schema.values() {
                let id = blob::write_json(&repo, shape)?;
                mutator.put(SCHEMA_DIR, &format!("{}.json", shape.name), id)?;
            }
        }
        for (collection, n) in tx.sequences.iter().filter(|(c, _)| tx.schema.contains_key(*c)) {
            let id = blob::write_json(&repo, n)?;
            mutator.put(SEQUENCE_DIR, &format!("{}.json", collection), id)?;
        }
        if tx.history_dirty {
            let id = blob::write_json(&repo, &tx.history)?;
            mutator.put(MIGRATION_DIR, HISTORY_FILE, id)?;
        }

        let tree_id = mutator.write()?;
        let message = tx.summary.message(&tx.id);
        let commit_id =
            commit::create_commit(&repo, tree_id, tx.base, &message, &tx.store.inner.signature)?;
        refs::update_main_if_unchanged(&repo, tx.base, commit_id)?;

        tracing::debug!(tx = %tx.id, commit = %commit_id, summary = %tx.summary, "transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StorageResult<()> {
        tracing::debug!(tx = %self.id, store = "git", "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataType, FieldDef};
    use crate::query::Predicate;
    use crate::storage::types::{ForeignKeyRef, KeyGeneration};
    use serde_json::json;
    use tempfile::TempDir;

    fn shapes() -> Vec<SchemaChange> {
        vec![
            SchemaChange::CreateCollection {
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
            },
            SchemaChange::CreateCollection {
                shape: CollectionShape {
                    name: "order".into(),
                    fields: vec![
                        FieldDef::new("id", DataType::Text),
                        FieldDef::required("qty", DataType::Integer),
                        FieldDef::new("customer_id", DataType::Integer),
                    ],
                    primary_key: "id".into(),
                    key_generation: Some(KeyGeneration::Ulid),
                    references: vec![ForeignKeyRef::new("customer_id", "customer")],
                },
            },
        ]
    }

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let store = GitStore::init(dir.path()).unwrap();
        let mut tx = store.begin().unwrap();
        for change in shapes() {
            tx.alter(&change).unwrap();
        }
        tx.commit().unwrap();
        (dir, store)
    }

    fn row(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_init_and_reopen() {
        let (dir, store) = setup();
        let mut tx = store.begin().unwrap();
        let key = tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.commit().unwrap();
        let head = store.head().unwrap();
        drop(store);

        let store = GitStore::open(dir.path()).unwrap();
        assert_eq!(store.head().unwrap(), head);
        let ann = store.fetch_by_key("customer", &key).unwrap().unwrap();
        assert_eq!(ann["name"], json!("Ann"));
        assert_eq!(store.physical_schema().unwrap().len(), 2);
    }

    #[test]
    fn test_one_commit_per_transaction() {
        let (_dir, store) = setup();
        let before = store.head().unwrap();

        let mut tx = store.begin().unwrap();
        let c = tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        let o = tx
            .insert("order", row(json!({"qty": 2, "customer_id": c.to_value()})))
            .unwrap();
        assert!(matches!(o, KeyValue::Text(_)));
        tx.commit().unwrap();

        let repo = Repository::open(store.path()).unwrap();
        let head = repo.find_commit(refs::main_commit(&repo).unwrap()).unwrap();
        assert_eq!(head.parent_id(0).unwrap().to_string(), before);
        assert!(head.message().unwrap().contains("2 insert(s)"));
    }

    #[test]
    fn test_rollback_leaves_main() {
        let (_dir, store) = setup();
        let before = store.head().unwrap();
        let mut tx = store.begin().unwrap();
        tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.head().unwrap(), before);
        assert!(store
            .fetch_by_predicate("customer", &FetchRequest::all())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_sequence_survives_commits() {
        let (_dir, store) = setup();
        for expected in 1..=3 {
            let mut tx = store.begin().unwrap();
            let key = tx.insert("customer", row(json!({"name": "x"}))).unwrap();
            tx.commit().unwrap();
            assert_eq!(key, KeyValue::Int(expected));
        }
        let found = store
            .fetch_by_predicate("customer", &FetchRequest::filtered(Predicate::gt("id", 1)))
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_integrity_inside_transaction() {
        let (_dir, store) = setup();
        let mut tx = store.begin().unwrap();
        let c = tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.insert("order", row(json!({"qty": 1, "customer_id": c.to_value()})))
            .unwrap();
        assert!(matches!(
            tx.delete("customer", &c),
            Err(StorageError::StillReferenced { .. })
        ));
        assert!(matches!(
            tx.insert("order", row(json!({"qty": 1, "customer_id": 99}))),
            Err(StorageError::ForeignKeyViolation { .. })
        ));
    }

    #[test]
    fn test_concurrent_writer_detected() {
        let (dir, store) = setup();
        let other = GitStore::open(dir.path()).unwrap();

        let mut first = store.begin().unwrap();
        let mut second = other.begin().unwrap();
        first.insert("customer", row(json!({"name": "A"}))).unwrap();
        second.insert("customer", row(json!({"name": "B"}))).unwrap();

        first.commit().unwrap();
        assert!(matches!(
            second.commit(),
            Err(StorageError::ConcurrentModification { .. })
        ));
        let names: Vec<_> = store
            .fetch_by_predicate("customer", &FetchRequest::all())
            .unwrap()
            .into_iter()
            .map(|r| r["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("A")]);
    }

    #[test]
    fn test_alter_and_history() {
        let (_dir, store) = setup();
        let mut tx = store.begin().unwrap();
        tx.insert("customer", row(json!({"name": "Ann"}))).unwrap();
        tx.alter(&SchemaChange::AddField {
            collection: "customer".into(),
            field: FieldDef::new("tier", DataType::Text).with_default(json!("basic")),
        })
        .unwrap();
        tx.append_migration_history(HistoryEntry::new("002_tier", "abc"))
            .unwrap();
        tx.commit().unwrap();

        let ann = store.fetch_by_key("customer", &KeyValue::Int(1)).unwrap().unwrap();
        assert_eq!(ann["tier"], json!("basic"));
        let history = store.read_migration_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step_id, "002_tier");
    }

    #[test]
    fn test_drop_collection_removes_rows() {
        let (_dir, store) = setup();
        let mut tx = store.begin().unwrap();
        tx.alter(&shapes()[1].inverse()).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            store.fetch_by_predicate("order", &FetchRequest::all()),
            Err(StorageError::UnknownCollection(_))
        ));
        assert!(!store.physical_schema().unwrap().contains_key("order"));
    }

    #[test]
    fn test_migration_lock() {
        let (dir, store) = setup();
        let other = GitStore::open(dir.path()).unwrap();
        store.try_lock_migrations("one").unwrap();
        assert!(matches!(
            other.try_lock_migrations("two"),
            Err(StorageError::MigrationLocked { .. })
        ));
        store.unlock_migrations("one").unwrap();
        other.try_lock_migrations("two").unwrap();
    }
}
