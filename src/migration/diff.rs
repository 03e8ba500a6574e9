//! Schema diffing: what the catalog declares versus what a store holds.

use std::collections::BTreeSet;

use crate::catalog::{Catalog, DataType};
use crate::storage::{
    CollectionShape, ForeignKeyRef, KeyGeneration, PhysicalSchema, SchemaChange, StorageResult,
};

/// The physical schema the catalog asks for.
pub fn declared_schema(catalog: &Catalog) -> PhysicalSchema {
    let mut schema = PhysicalSchema::new();
    for rt in catalog.all_types() {
        let key_generation = if rt.has_generated_key() {
            match rt.field(&rt.primary_key).map(|f| f.data_type) {
                Some(DataType::Integer) => Some(KeyGeneration::Sequence),
                Some(DataType::Text) => Some(KeyGeneration::Ulid),
                _ => None,
            }
        } else {
            None
        };
        let mut references: Vec<ForeignKeyRef> = catalog
            .references_from(&rt.name)
            .map(|r| ForeignKeyRef::new(&r.foreign_key, &r.parent))
            .collect();
        references.sort();
        references.dedup();
        schema.insert(
            rt.name.clone(),
            CollectionShape {
                name: rt.name.clone(),
                fields: rt.fields.clone(),
                primary_key: rt.primary_key.clone(),
                key_generation,
                references,
            },
        );
    }
    schema
}

/// Whether a collection has to be dropped and created again rather than
/// altered in place.
fn needs_rebuild(from: &CollectionShape, to: &CollectionShape) -> bool {
    from.primary_key != to.primary_key
        || from.key_generation != to.key_generation
        || from.field(&from.primary_key) != to.field(&to.primary_key)
}

/// Changes that take `from` to `to`.
///
/// Ordering: references are dropped first and added last so that every
/// intermediate schema is valid; fields whose definition changed are
/// dropped and added again.
pub fn diff(from: &PhysicalSchema, to: &PhysicalSchema) -> StorageResult<Vec<SchemaChange>> {
    let mut current = from.clone();
    let mut changes = Vec::new();
    let mut emit = |change: SchemaChange, current: &mut PhysicalSchema| -> StorageResult<()> {
        change.apply_to(current)?;
        changes.push(change);
        Ok(())
    };

    let removed: BTreeSet<String> = from
        .values()
        .filter(|shape| match to.get(&shape.name) {
            Some(target) => needs_rebuild(shape, target),
            None => true,
        })
        .map(|shape| shape.name.clone())
        .collect();

    // references that go away, or sit on a collection, parent or field
    // that is about to change
    for shape in from.values() {
        let target = to.get(&shape.name);
        for reference in &shape.references {
            let keep = !removed.contains(&shape.name)
                && !removed.contains(&reference.parent)
                && target.map_or(false, |t| {
                    t.references.contains(reference)
                        && t.field(&reference.field) == shape.field(&reference.field)
                });
            if !keep {
                emit(
                    SchemaChange::DropReference {
                        collection: shape.name.clone(),
                        reference: reference.clone(),
                    },
                    &mut current,
                )?;
            }
        }
    }

    for shape in from.values().filter(|s| !removed.contains(&s.name)) {
        let Some(target) = to.get(&shape.name) else {
            continue;
        };
        for field in &shape.fields {
            if target.field(&field.name) != Some(field) {
                emit(
                    SchemaChange::DropField {
                        collection: shape.name.clone(),
                        field: field.clone(),
                    },
                    &mut current,
                )?;
            }
        }
    }

    for name in &removed {
        if let Some(shape) = current.get(name).cloned() {
            emit(SchemaChange::DropCollection { shape }, &mut current)?;
        }
    }

    for shape in to.values() {
        if !current.contains_key(&shape.name) {
            let bare = CollectionShape {
                references: Vec::new(),
                ..shape.clone()
            };
            emit(SchemaChange::CreateCollection { shape: bare }, &mut current)?;
        }
    }

    for shape in to.values() {
        for field in &shape.fields {
            let present = current
                .get(&shape.name)
                .map_or(false, |c| c.field(&field.name).is_some());
            if !present {
                emit(
                    SchemaChange::AddField {
                        collection: shape.name.clone(),
                        field: field.clone(),
                    },
                    &mut current,
                )?;
            }
        }
    }

    for shape in to.values() {
        for reference in &shape.references {
            let present = current
                .get(&shape.name)
                .map_or(false, |c| c.references.contains(reference));
            if !present {
                emit(
                    SchemaChange::AddReference {
                        collection: shape.name.clone(),
                        reference: reference.clone(),
                    },
                    &mut current,
                )?;
            }
        }
    }

    Ok(changes)
}

/// Whether two schemas hold the same collections, fields and references,
/// ignoring declaration order.
pub fn same_schema(a: &PhysicalSchema, b: &PhysicalSchema) -> bool {
    matches!(diff(a, b), Ok(changes) if changes.is_empty())
}
