//! Store adapter boundary.
//!
//! The engine talks to a backing store only through the [`Store`] and
//! [`StoreTransaction`] traits. Two adapters ship with the crate:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │        session / query / migration (engine layers)           │
//! └──────────────────────────────────────────────────────────────┘
//!                              │  Store, StoreTransaction
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!       ┌─────────────┐                 ┌─────────────┐
//!       │ MemoryStore │                 │  GitStore   │
//!       │ (in-process)│                 │ (git2 repo) │
//!       └─────────────┘                 └─────────────┘
//! ```
//!
//! Writes happen only inside a transaction, and a transaction either commits
//! all of its writes or none. Both adapters enforce the physical schema
//! (field types, nullability, keys and foreign-key references) so that a
//! bad batch fails inside the transaction instead of leaving partial state.

mod constraints;
mod error;
mod fetch;
pub mod git;
mod memory;
mod types;

pub use error::{StorageError, StorageResult};
pub use fetch::FetchRequest;
pub use git::{GitSignature, GitStore};
pub use memory::{MemoryStore, StoreStats};
pub use types::{
    CollectionShape, ForeignKeyRef, HistoryEntry, KeyGeneration, PhysicalSchema, SchemaChange,
};

use crate::catalog::{KeyValue, Record};

/// Which query constructs a store evaluates natively.
///
/// The query engine refuses anything outside this set before touching the
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// `!=`, `<`, `<=`, `>`, `>=`. Equality is always available.
    pub comparisons: bool,
    pub in_list: bool,
    pub null_checks: bool,
    pub pattern_match: bool,
    /// `AND`, `OR`, `NOT`.
    pub boolean_logic: bool,
    pub ordering: bool,
    pub paging: bool,
}

impl StoreCapabilities {
    /// Everything the predicate model can express.
    pub const fn full() -> Self {
        Self {
            comparisons: true,
            in_list: true,
            null_checks: true,
            pattern_match: true,
            boolean_logic: true,
            ordering: true,
            paging: true,
        }
    }

    /// Equality and `IN` only, no ordering or paging.
    pub const fn equality_only() -> Self {
        Self {
            comparisons: false,
            in_list: true,
            null_checks: false,
            pattern_match: false,
            boolean_logic: false,
            ordering: false,
            paging: false,
        }
    }
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// A backing store.
///
/// Reads outside a transaction see the last committed state.
pub trait Store: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> StoreCapabilities;

    fn fetch_by_key(&self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>>;

    fn fetch_by_predicate(
        &self,
        collection: &str,
        request: &FetchRequest,
    ) -> StorageResult<Vec<Record>>;

    /// Start a write transaction. Transactions on one store are serialized.
    fn begin(&self) -> StorageResult<Box<dyn StoreTransaction + '_>>;

    /// Applied migration steps, oldest first.
    fn read_migration_history(&self) -> StorageResult<Vec<HistoryEntry>>;

    fn physical_schema(&self) -> StorageResult<PhysicalSchema>;

    /// Take the exclusive migration lock, failing with
    /// [`StorageError::MigrationLocked`] if another owner holds it.
    fn try_lock_migrations(&self, owner: &str) -> StorageResult<()>;

    fn unlock_migrations(&self, owner: &str) -> StorageResult<()>;
}

/// An open write transaction. Dropping it without committing rolls back.
pub trait StoreTransaction {
    fn id(&self) -> &str;

    /// Read a row as this transaction sees it.
    fn fetch_by_key(&mut self, collection: &str, key: &KeyValue) -> StorageResult<Option<Record>>;

    /// Insert a row and return its key, assigning one if the collection
    /// generates keys and the row carries none.
    fn insert(&mut self, collection: &str, record: Record) -> StorageResult<KeyValue>;

    fn update(&mut self, collection: &str, key: &KeyValue, record: Record) -> StorageResult<()>;

    fn delete(&mut self, collection: &str, key: &KeyValue) -> StorageResult<()>;

    fn alter(&mut self, change: &SchemaChange) -> StorageResult<()>;

    fn append_migration_history(&mut self, entry: HistoryEntry) -> StorageResult<()>;

    /// Remove the most recent history entry, which must be `step_id`.
    fn remove_migration_history(&mut self, step_id: &str) -> StorageResult<()>;

    fn commit(self: Box<Self>) -> StorageResult<()>;

    fn rollback(self: Box<Self>) -> StorageResult<()>;
}
