//! Sessions: identity map, change tracking and unit of work.
//!
//! A session is the caller's working set against one store:
//!
//! ```text
//!   open ─► find / query ─► set / register_new / mark_deleted ─► commit ─► close
//!               │                                                   │
//!               ▼                                                   ▼
//!         IdentityMap  ◄──── state transitions ─────────────  UnitOfWork
//! ```
//!
//! Sessions are not shared across threads. Several sessions may run against
//! the same store at once; they are isolated by the store's transactions and
//! by the optimistic check the unit of work runs before every write.

mod error;
mod identity;
mod lazy;
mod tracker;
mod unit_of_work;

pub use error::{SessionError, SessionResult};
pub use identity::{IdentityMap, InstanceId, LifecycleState, Related, TrackedInstance};
pub use tracker::PendingChanges;
pub use unit_of_work::CommitResult;

use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{AssociationKind, Catalog, KeyValue, Record, SchemaError};
use crate::query::Query;
use crate::storage::{Store, StorageError};
use identity::PendingLink;
use tracker::invalid_state;

/// Per-session behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Resolve associations that weren't included on first access.
    pub lazy_loading: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { lazy_loading: true }
    }
}

/// A unit of work against a store.
pub struct Session {
    id: String,
    store: Arc<dyn Store>,
    catalog: Catalog,
    options: SessionOptions,
    map: IdentityMap,
    open: bool,
}

impl Session {
    pub fn new(store: Arc<dyn Store>, catalog: Catalog) -> Self {
        Self::with_options(store, catalog, SessionOptions::default())
    }

    pub fn with_options(store: Arc<dyn Store>, catalog: Catalog, options: SessionOptions) -> Self {
        let id = ulid::Ulid::new().to_string();
        tracing::debug!(session = %id, store = store.name(), "session opened");
        Self {
            id,
            store,
            catalog,
            options,
            map: IdentityMap::new(),
            open: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.map
    }

    /// Start a query over one record type.
    pub fn query(&mut self, record_type: &str) -> Query<'_> {
        Query::new(self, record_type)
    }

    /// Fetch by primary key through the identity map. A tracked instance is
    /// returned without touching the store.
    pub fn find(
        &mut self,
        record_type: &str,
        key: impl Into<KeyValue>,
    ) -> SessionResult<Option<InstanceId>> {
        let key = key.into();
        self.catalog.describe(record_type)?;
        if let Some(id) = self.map.lookup(record_type, &key) {
            return Ok(Some(id));
        }
        self.ensure_open()?;
        let store = Arc::clone(&self.store);
        self.map.get_or_create(record_type, &key, || {
            tracing::debug!(record_type, %key, "fetch by key");
            store.fetch_by_key(record_type, &key).map_err(SessionError::from)
        })
    }

    /// Like [`Self::find`], failing when the row doesn't exist.
    pub fn get(&mut self, record_type: &str, key: impl Into<KeyValue>) -> SessionResult<InstanceId> {
        let key = key.into();
        self.find(record_type, key.clone())?.ok_or_else(|| {
            SessionError::Storage(StorageError::RowNotFound {
                collection: record_type.to_string(),
                key,
            })
        })
    }

    pub fn instance(&self, id: InstanceId) -> SessionResult<&TrackedInstance> {
        self.map.get(id).ok_or(SessionError::UnknownInstance(id))
    }

    pub fn state(&self, id: InstanceId) -> SessionResult<LifecycleState> {
        Ok(self.instance(id)?.state())
    }

    /// Current value of a field.
    pub fn value(&self, id: InstanceId, field: &str) -> SessionResult<&Value> {
        let instance = self.instance(id)?;
        let record_type = self.catalog.describe(instance.record_type())?;
        if record_type.field(field).is_none() {
            return Err(SchemaError::FieldNotFound {
                record_type: record_type.name.clone(),
                field: field.to_string(),
            }
            .into());
        }
        Ok(instance.get(field))
    }

    pub fn key(&self, id: InstanceId) -> SessionResult<Option<&KeyValue>> {
        Ok(self.instance(id)?.key())
    }

    /// Track a new record as `Added`. Absent fields take their defaults.
    pub fn register_new(&mut self, record_type: &str, mut record: Record) -> SessionResult<InstanceId> {
        self.ensure_open()?;
        let catalog = self.catalog.clone();
        let rt = catalog.describe(record_type)?;
        rt.apply_defaults(&mut record);
        rt.validate_record(&record)?;

        let key = rt.key_of(&record);
        self.map.register(record_type, key, record).or_else(|existing| {
            let instance = self.instance(existing)?;
            Err(invalid_state(instance, existing, "register a duplicate of"))
        })
    }

    /// Set a field on a tracked instance.
    pub fn set(&mut self, id: InstanceId, field: &str, value: impl Into<Value>) -> SessionResult<()> {
        let catalog = self.catalog.clone();
        let rt = catalog.describe(self.instance(id)?.record_type())?;
        self.map.record_edit(id, rt, field, value.into())
    }

    pub fn mark_deleted(&mut self, id: InstanceId) -> SessionResult<()> {
        self.map.mark_deleted(id)
    }

    /// Forget an `Added` instance before it is ever written.
    pub fn discard(&mut self, id: InstanceId) -> SessionResult<()> {
        self.map.unregister(id)
    }

    /// Stop tracking an instance. Its pending changes are dropped.
    pub fn evict(&mut self, id: InstanceId) -> SessionResult<()> {
        self.instance(id)?;
        self.map.evict(id);
        Ok(())
    }

    /// Link two instances through `association` of `owner`.
    ///
    /// For a to-one association `owner` is the child and `other` the parent;
    /// for a to-many association it is the other way round. If the parent
    /// has no key yet, the foreign key is filled in at commit time once the
    /// store has assigned one.
    pub fn attach(
        &mut self,
        owner: InstanceId,
        association: &str,
        other: InstanceId,
    ) -> SessionResult<()> {
        let catalog = self.catalog.clone();
        let owner_type = catalog.describe(self.instance(owner)?.record_type())?;
        let assoc = owner_type
            .association(association)
            .ok_or_else(|| SessionError::UnknownAssociation {
                record_type: owner_type.name.clone(),
                association: association.to_string(),
            })?;

        let other_type = self.instance(other)?.record_type().to_string();
        if other_type != assoc.target {
            return Err(SchemaError::InvalidValue(format!(
                "{}.{} expects {}, got {}",
                owner_type.name, assoc.name, assoc.target, other_type
            ))
            .into());
        }

        let (child, parent) = match assoc.kind {
            AssociationKind::ToOne => (owner, other),
            AssociationKind::ToMany => (other, owner),
        };
        let parent_instance = self.instance(parent)?;
        if matches!(
            parent_instance.state(),
            LifecycleState::Deleted | LifecycleState::Detached
        ) {
            return Err(invalid_state(parent_instance, parent, "link to"));
        }
        let parent_key = parent_instance.key().cloned();

        let child_type = catalog.describe(self.instance(child)?.record_type())?;
        let foreign_key = assoc.foreign_key.clone();
        match parent_key {
            Some(key) => self.map.record_edit(child, child_type, &foreign_key, key.to_value())?,
            None => {
                let instance = self
                    .map
                    .get_mut(child)
                    .ok_or(SessionError::UnknownInstance(child))?;
                if !matches!(
                    instance.state(),
                    LifecycleState::Added | LifecycleState::Unchanged | LifecycleState::Modified
                ) {
                    return Err(invalid_state(instance, child, "link"));
                }
                let child_assoc = child_type.to_one_for_field(&foreign_key).map(|a| a.name.clone());
                instance.links.retain(|l| l.foreign_key != foreign_key);
                instance.links.push(PendingLink {
                    association: child_assoc.unwrap_or_else(|| assoc.name.clone()),
                    foreign_key: foreign_key.clone(),
                    parent,
                });
                self.map.refresh(child, child_type);
            }
        }

        if let Some(to_one) = child_type.to_one_for_field(&foreign_key) {
            self.cache_related(child, &to_one.name, Related::One(Some(parent)));
        }
        if let Some(to_many) = catalog
            .describe(&assoc_parent_type(assoc, &owner_type.name))?
            .associations
            .iter()
            .find(|a| a.is_to_many() && a.foreign_key == foreign_key && a.target == child_type.name)
        {
            if let Some(Related::Many(children)) = self
                .map
                .get_mut(parent)
                .and_then(|p| p.associations.get_mut(&to_many.name))
            {
                if !children.contains(&child) {
                    children.push(child);
                }
            }
        }
        Ok(())
    }

    /// What the next commit will write.
    pub fn pending_changes(&self) -> PendingChanges {
        self.map.pending_changes()
    }

    pub fn has_changes(&self) -> bool {
        !self.pending_changes().is_empty()
    }

    /// Close the session. Every instance becomes `Detached`; values stay
    /// readable but nothing more is fetched or written.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        let pending = self.pending_changes();
        if !pending.is_empty() {
            tracing::warn!(session = %self.id, discarded = pending.len(), "session closed with uncommitted changes");
        }
        self.map.clear();
        self.open = false;
        tracing::debug!(session = %self.id, "session closed");
    }

    pub(crate) fn ensure_open(&self) -> SessionResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(SessionError::DetachedSession(self.id.clone()))
        }
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Route a fetched row through the identity map.
    pub(crate) fn materialize(&mut self, record_type: &str, row: Record) -> SessionResult<InstanceId> {
        let catalog = self.catalog.clone();
        let rt = catalog.describe(record_type)?;
        let key = rt.key_of(&row).ok_or_else(|| {
            SessionError::Storage(StorageError::InvalidKey(format!(
                "{} row without a usable {}",
                record_type, rt.primary_key
            )))
        })?;
        Ok(self.map.track_fetched(record_type, &key, row))
    }

    pub(crate) fn cache_related(&mut self, id: InstanceId, association: &str, related: Related) {
        if let Some(instance) = self.map.get_mut(id) {
            instance.associations.insert(association.to_string(), related);
        }
    }
}

/// The record type holding the key side of `assoc`, declared on `owner`.
fn assoc_parent_type(assoc: &crate::catalog::Association, owner: &str) -> String {
    match assoc.kind {
        AssociationKind::ToOne => assoc.target.clone(),
        AssociationKind::ToMany => owner.to_string(),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("store", &self.store.name())
            .field("open", &self.open)
            .field("tracked", &self.map.len())
            .finish()
    }
}
