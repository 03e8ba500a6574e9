//! Change tracking over the identity map.

use serde_json::Value;

use crate::catalog::{field_value, values_equal, KeyValue, Record, RecordType, SchemaError};
use crate::session::error::{SessionError, SessionResult};
use crate::session::identity::{IdentityMap, InstanceId, LifecycleState, TrackedInstance};

/// Snapshot of what the next commit will write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub added: Vec<InstanceId>,
    pub modified: Vec<InstanceId>,
    pub deleted: Vec<InstanceId>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

pub(crate) fn invalid_state(
    instance: &TrackedInstance,
    id: InstanceId,
    action: &'static str,
) -> SessionError {
    SessionError::InvalidState {
        record_type: instance.record_type().to_string(),
        instance: id,
        state: instance.state(),
        action,
    }
}

/// Whether `a` and `b` hold the same values for every declared field.
/// Foreign keys compare as keys.
pub(crate) fn same_values(record_type: &RecordType, a: &Record, b: &Record) -> bool {
    record_type.fields.iter().all(|field| {
        let (x, y) = (field_value(a, &field.name), field_value(b, &field.name));
        if record_type.to_one_for_field(&field.name).is_some() {
            KeyValue::from_value(x) == KeyValue::from_value(y)
        } else {
            values_equal(x, y)
        }
    })
}

impl IdentityMap {
    fn tracked_mut(&mut self, id: InstanceId) -> SessionResult<&mut TrackedInstance> {
        self.get_mut(id).ok_or(SessionError::UnknownInstance(id))
    }

    /// Set a field's current value and recompute the instance's state.
    pub fn record_edit(
        &mut self,
        id: InstanceId,
        record_type: &RecordType,
        field: &str,
        value: Value,
    ) -> SessionResult<()> {
        let instance = self.tracked_mut(id)?;
        match instance.state() {
            LifecycleState::Deleted | LifecycleState::Detached => {
                return Err(invalid_state(instance, id, "edit"));
            }
            LifecycleState::Added => {}
            LifecycleState::Unchanged | LifecycleState::Modified => {
                if field == record_type.primary_key {
                    return Err(invalid_state(instance, id, "change the primary key of"));
                }
            }
        }

        let def = record_type
            .field(field)
            .ok_or_else(|| SchemaError::FieldNotFound {
                record_type: record_type.name.clone(),
                field: field.to_string(),
            })?;
        def.validate(Some(&value)).map_err(SchemaError::InvalidValue)?;

        // only added instances get this far with a key edit
        if field == record_type.primary_key {
            if self.rekey(id, KeyValue::from_value(&value)).is_err() {
                let instance = self.tracked_mut(id)?;
                return Err(invalid_state(instance, id, "move onto an already tracked key"));
            }
        }

        let instance = self.tracked_mut(id)?;
        instance.current_mut().insert(field.to_string(), value);
        if let Some(assoc) = record_type.to_one_for_field(field) {
            instance.associations.remove(&assoc.name);
            instance.links.retain(|l| l.foreign_key != field);
        }
        refresh_state(instance, record_type);
        Ok(())
    }

    /// `Unchanged`/`Modified` → `Deleted`.
    pub fn mark_deleted(&mut self, id: InstanceId) -> SessionResult<()> {
        let instance = self.tracked_mut(id)?;
        match instance.state() {
            LifecycleState::Unchanged | LifecycleState::Modified => {
                instance.set_state(LifecycleState::Deleted);
                instance.links.clear();
                Ok(())
            }
            LifecycleState::Added => Err(invalid_state(instance, id, "delete uncommitted")),
            LifecycleState::Deleted | LifecycleState::Detached => {
                Err(invalid_state(instance, id, "delete"))
            }
        }
    }

    /// Drop an uncommitted `Added` instance.
    pub fn unregister(&mut self, id: InstanceId) -> SessionResult<()> {
        let instance = self.tracked_mut(id)?;
        if instance.state() != LifecycleState::Added {
            return Err(invalid_state(instance, id, "unregister"));
        }
        self.evict(id);
        Ok(())
    }

    /// Classify every tracked instance with work pending, in registration
    /// order.
    pub fn pending_changes(&self) -> PendingChanges {
        let mut pending = PendingChanges::default();
        for id in self.tracked() {
            let Some(instance) = self.get(id) else {
                continue;
            };
            match instance.state() {
                LifecycleState::Added => pending.added.push(id),
                LifecycleState::Modified => pending.modified.push(id),
                LifecycleState::Deleted => pending.deleted.push(id),
                LifecycleState::Unchanged | LifecycleState::Detached => {}
            }
        }
        pending
    }

    pub(crate) fn refresh(&mut self, id: InstanceId, record_type: &RecordType) {
        if let Some(instance) = self.get_mut(id) {
            refresh_state(instance, record_type);
        }
    }
}

/// Recompute Unchanged/Modified from the values. Other states are sticky.
fn refresh_state(instance: &mut TrackedInstance, record_type: &RecordType) {
    if !matches!(
        instance.state(),
        LifecycleState::Unchanged | LifecycleState::Modified
    ) {
        return;
    }
    let unchanged = instance.links.is_empty()
        && instance
            .original()
            .map(|original| same_values(record_type, original, instance.current()))
            .unwrap_or(false);
    instance.set_state(if unchanged {
        LifecycleState::Unchanged
    } else {
        LifecycleState::Modified
    });
}
