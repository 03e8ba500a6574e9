//! Lazy association resolution.
//!
//! An association that was not included in the query that produced its
//! owner is fetched on first access and cached on the owner for the rest of
//! the session. Request/response callers should prefer `include`: once the
//! session is closed, nothing unresolved can be fetched.

use crate::catalog::{AssociationKind, KeyValue};
use crate::query::Predicate;
use crate::session::error::{SessionError, SessionResult};
use crate::session::identity::{InstanceId, LifecycleState, Related};
use crate::session::tracker::invalid_state;
use crate::session::Session;
use crate::storage::FetchRequest;

impl Session {
    /// Instances of a to-many association.
    pub fn related(&mut self, id: InstanceId, association: &str) -> SessionResult<Vec<InstanceId>> {
        match self.resolve(id, association)? {
            Related::Many(children) => Ok(children),
            Related::One(parent) => Ok(parent.into_iter().collect()),
        }
    }

    /// Instance of a to-one association, `None` when the foreign key is null.
    pub fn related_one(
        &mut self,
        id: InstanceId,
        association: &str,
    ) -> SessionResult<Option<InstanceId>> {
        match self.resolve(id, association)? {
            Related::One(parent) => Ok(parent),
            Related::Many(_) => Err(SessionError::UnknownAssociation {
                record_type: self.instance(id)?.record_type().to_string(),
                association: format!("{} (to-many)", association),
            }),
        }
    }

    fn resolve(&mut self, id: InstanceId, association: &str) -> SessionResult<Related> {
        let instance = self.instance(id)?;
        if let Some(related) = instance.associations.get(association) {
            return Ok(related.clone());
        }

        let catalog = self.catalog.clone();
        let record_type = catalog.describe(instance.record_type())?;
        let assoc = record_type
            .association(association)
            .ok_or_else(|| SessionError::UnknownAssociation {
                record_type: record_type.name.clone(),
                association: association.to_string(),
            })?;

        // resolvable without a fetch
        if assoc.kind == AssociationKind::ToOne {
            if let Some(link) = instance
                .links
                .iter()
                .find(|l| l.foreign_key == assoc.foreign_key)
            {
                return Ok(Related::One(Some(link.parent)));
            }
            let Some(key) = KeyValue::from_value(instance.get(&assoc.foreign_key)) else {
                return Ok(Related::One(None));
            };
            if let Some(parent) = self.map.lookup(&assoc.target, &key) {
                let related = Related::One(Some(parent));
                self.cache_related(id, association, related.clone());
                return Ok(related);
            }
        } else if instance.key().is_none() {
            return Ok(Related::Many(Vec::new()));
        }

        self.ensure_open()?;
        if instance.state() == LifecycleState::Detached {
            return Err(invalid_state(instance, id, "load associations of"));
        }
        if !self.options.lazy_loading {
            return Err(SessionError::LazyLoadingDisabled {
                record_type: record_type.name.clone(),
                association: association.to_string(),
            });
        }

        let related = match assoc.kind {
            AssociationKind::ToOne => {
                let key = KeyValue::from_value(instance.get(&assoc.foreign_key));
                match key {
                    Some(key) => Related::One(self.find(&assoc.target, key)?),
                    None => Related::One(None),
                }
            }
            AssociationKind::ToMany => {
                let key = instance.key().cloned();
                let mut children = Vec::new();
                if let Some(key) = key {
                    let filter = if self.store.capabilities().in_list {
                        Predicate::in_list(&assoc.foreign_key, [key.to_value()])
                    } else {
                        Predicate::eq(&assoc.foreign_key, key.to_value())
                    };
                    tracing::debug!(record_type = %record_type.name, association, owner = %key, "lazy load");
                    let rows = self
                        .store
                        .fetch_by_predicate(&assoc.target, &FetchRequest::filtered(filter))?;
                    for row in rows {
                        children.push(self.materialize(&assoc.target, row)?);
                    }
                }
                Related::Many(children)
            }
        };
        self.cache_related(id, association, related.clone());
        Ok(related)
    }
}
