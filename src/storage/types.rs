//! Physical schema types shared by every store adapter.
//!
//! The physical schema is what a store actually holds: one
//! [`CollectionShape`] per collection. Migration steps move it between
//! versions through [`SchemaChange`]s.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{DataType, FieldDef};
use crate::storage::error::{StorageError, StorageResult};

/// How a store assigns primary keys on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGeneration {
    /// Monotonic integer sequence starting at 1.
    Sequence,
    /// ULID text key.
    Ulid,
}

/// A foreign-key reference from a field to another collection's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub field: String,
    pub parent: String,
}

impl ForeignKeyRef {
    pub fn new(field: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            parent: parent.into(),
        }
    }
}

/// Stored shape of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionShape {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_generation: Option<KeyGeneration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ForeignKeyRef>,
}

impl CollectionShape {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Data type of the primary key.
    pub fn key_type(&self) -> StorageResult<DataType> {
        self.field(&self.primary_key)
            .map(|f| f.data_type)
            .ok_or_else(|| StorageError::SchemaViolation {
                collection: self.name.clone(),
                reason: format!("primary key '{}' is not a field", self.primary_key),
            })
    }

    /// The reference held by `field`, if any.
    pub fn reference_for(&self, field: &str) -> Option<&ForeignKeyRef> {
        self.references.iter().find(|r| r.field == field)
    }
}

/// The full physical schema of a store, keyed by collection name.
pub type PhysicalSchema = BTreeMap<String, CollectionShape>;

/// One reversible change to the physical schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateCollection {
        shape: CollectionShape,
    },
    /// Carries the dropped shape so the change can be reverted.
    DropCollection {
        shape: CollectionShape,
    },
    AddField {
        collection: String,
        field: FieldDef,
    },
    DropField {
        collection: String,
        field: FieldDef,
    },
    AddReference {
        collection: String,
        reference: ForeignKeyRef,
    },
    DropReference {
        collection: String,
        reference: ForeignKeyRef,
    },
}

impl SchemaChange {
    /// The change that undoes this one.
    pub fn inverse(&self) -> SchemaChange {
        match self.clone() {
            SchemaChange::CreateCollection { shape } => SchemaChange::DropCollection { shape },
            SchemaChange::DropCollection { shape } => SchemaChange::CreateCollection { shape },
            SchemaChange::AddField { collection, field } => {
                SchemaChange::DropField { collection, field }
            }
            SchemaChange::DropField { collection, field } => {
                SchemaChange::AddField { collection, field }
            }
            SchemaChange::AddReference {
                collection,
                reference,
            } => SchemaChange::DropReference {
                collection,
                reference,
            },
            SchemaChange::DropReference {
                collection,
                reference,
            } => SchemaChange::AddReference {
                collection,
                reference,
            },
        }
    }

    /// Name of the collection the change touches.
    pub fn collection(&self) -> &str {
        match self {
            SchemaChange::CreateCollection { shape } | SchemaChange::DropCollection { shape } => {
                &shape.name
            }
            SchemaChange::AddField { collection, .. }
            | SchemaChange::DropField { collection, .. }
            | SchemaChange::AddReference { collection, .. }
            | SchemaChange::DropReference { collection, .. } => collection,
        }
    }

    /// Apply the change to shapes only, checking shape-level preconditions.
    /// Row-level effects are the adapter's job.
    pub fn apply_to(&self, schema: &mut PhysicalSchema) -> StorageResult<()> {
        match self {
            SchemaChange::CreateCollection { shape } => {
                if schema.contains_key(&shape.name) {
                    return Err(StorageError::CollectionExists(shape.name.clone()));
                }
                shape.key_type()?;
                for r in &shape.references {
                    if shape.field(&r.field).is_none() {
                        return Err(unknown_field(&shape.name, &r.field));
                    }
                    if r.parent != shape.name && !schema.contains_key(&r.parent) {
                        return Err(StorageError::UnknownCollection(r.parent.clone()));
                    }
                }
                schema.insert(shape.name.clone(), shape.clone());
            }
            SchemaChange::DropCollection { shape } => {
                if !schema.contains_key(&shape.name) {
                    return Err(StorageError::UnknownCollection(shape.name.clone()));
                }
                let referrer = schema.values().find(|other| {
                    other.name != shape.name
                        && other.references.iter().any(|r| r.parent == shape.name)
                });
                if let Some(referrer) = referrer {
                    return Err(StorageError::StillReferenced {
                        collection: shape.name.clone(),
                        key: "*".into(),
                        referrer: referrer.name.clone(),
                    });
                }
                schema.remove(&shape.name);
            }
            SchemaChange::AddField { collection, field } => {
                let shape = shape_mut(schema, collection)?;
                if shape.field(&field.name).is_some() {
                    return Err(StorageError::FieldExists {
                        collection: collection.clone(),
                        field: field.name.clone(),
                    });
                }
                shape.fields.push(field.clone());
            }
            SchemaChange::DropField { collection, field } => {
                let shape = shape_mut(schema, collection)?;
                if shape.field(&field.name).is_none() {
                    return Err(unknown_field(collection, &field.name));
                }
                if shape.primary_key == field.name {
                    return Err(StorageError::SchemaViolation {
                        collection: collection.clone(),
                        reason: format!("cannot drop primary key '{}'", field.name),
                    });
                }
                if shape.reference_for(&field.name).is_some() {
                    return Err(StorageError::SchemaViolation {
                        collection: collection.clone(),
                        reason: format!("field '{}' still carries a reference", field.name),
                    });
                }
                shape.fields.retain(|f| f.name != field.name);
            }
            SchemaChange::AddReference {
                collection,
                reference,
            } => {
                if !schema.contains_key(&reference.parent) {
                    return Err(StorageError::UnknownCollection(reference.parent.clone()));
                }
                let shape = shape_mut(schema, collection)?;
                if shape.field(&reference.field).is_none() {
                    return Err(unknown_field(collection, &reference.field));
                }
                if shape.reference_for(&reference.field).is_some() {
                    return Err(StorageError::FieldExists {
                        collection: collection.clone(),
                        field: reference.field.clone(),
                    });
                }
                shape.references.push(reference.clone());
            }
            SchemaChange::DropReference {
                collection,
                reference,
            } => {
                let shape = shape_mut(schema, collection)?;
                let before = shape.references.len();
                shape.references.retain(|r| r != reference);
                if shape.references.len() == before {
                    return Err(StorageError::UnknownReference {
                        collection: collection.clone(),
                        field: reference.field.clone(),
                        parent: reference.parent.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn shape_mut<'a>(
    schema: &'a mut PhysicalSchema,
    collection: &str,
) -> StorageResult<&'a mut CollectionShape> {
    schema
        .get_mut(collection)
        .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))
}

fn unknown_field(collection: &str, field: &str) -> StorageError {
    StorageError::UnknownField {
        collection: collection.to_string(),
        field: field.to_string(),
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::CreateCollection { shape } => write!(f, "create collection {}", shape.name),
            SchemaChange::DropCollection { shape } => write!(f, "drop collection {}", shape.name),
            SchemaChange::AddField { collection, field } => {
                write!(f, "add field {}.{}", collection, field)
            }
            SchemaChange::DropField { collection, field } => {
                write!(f, "drop field {}.{}", collection, field.name)
            }
            SchemaChange::AddReference {
                collection,
                reference,
            } => write!(
                f,
                "add reference {}.{} -> {}",
                collection, reference.field, reference.parent
            ),
            SchemaChange::DropReference {
                collection,
                reference,
            } => write!(
                f,
                "drop reference {}.{} -> {}",
                collection, reference.field, reference.parent
            ),
        }
    }
}

/// One applied migration step, as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

impl HistoryEntry {
    pub fn new(step_id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            applied_at: Utc::now(),
            checksum: checksum.into(),
        }
    }
}
