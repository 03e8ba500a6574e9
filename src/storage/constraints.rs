//! Constraint enforcement shared by the store adapters.
//!
//! Adapters expose their (transaction-local) rows through [`RowSource`] and
//! run these checks before staging a write.

use serde_json::Value;

use crate::catalog::{field_value, KeyValue, Record};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{CollectionShape, KeyGeneration, PhysicalSchema, SchemaChange};

/// Read access to the rows a transaction currently sees.
pub(crate) trait RowSource {
    fn contains(&mut self, collection: &str, key: &KeyValue) -> StorageResult<bool>;

    /// All rows of a collection, in key order.
    fn rows(&mut self, collection: &str) -> StorageResult<Vec<Record>>;
}

pub(crate) fn shape<'a>(
    schema: &'a PhysicalSchema,
    collection: &str,
) -> StorageResult<&'a CollectionShape> {
    schema
        .get(collection)
        .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))
}

/// Check field names, types and nullability, and fill absent fields with
/// their defaults. A null generated key is left for the store to assign.
pub(crate) fn normalize_row(shape: &CollectionShape, mut record: Record) -> StorageResult<Record> {
    if let Some(name) = record.keys().find(|name| shape.field(name).is_none()) {
        return Err(StorageError::UnknownField {
            collection: shape.name.clone(),
            field: name.clone(),
        });
    }

    for field in &shape.fields {
        let value = record.get(&field.name).cloned().unwrap_or(Value::Null);
        let value = match (value, field.default_value()) {
            (Value::Null, Some(default)) => default.clone(),
            (value, _) => value,
        };
        let generated_key = field.name == shape.primary_key && shape.key_generation.is_some();
        if !(generated_key && value.is_null()) {
            field
                .validate(Some(&value))
                .map_err(|reason| StorageError::SchemaViolation {
                    collection: shape.name.clone(),
                    reason,
                })?;
        }
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

/// Read the primary key from a normalized row.
pub(crate) fn key_of(shape: &CollectionShape, record: &Record) -> StorageResult<KeyValue> {
    let value = field_value(record, &shape.primary_key);
    KeyValue::from_value(value).ok_or_else(|| {
        StorageError::InvalidKey(format!("{}.{} = {}", shape.name, shape.primary_key, value))
    })
}

/// Normalize a row for insertion and settle its key, drawing from
/// `sequence` when the key is generated.
pub(crate) fn prepare_insert(
    shape: &CollectionShape,
    record: Record,
    sequence: &mut i64,
) -> StorageResult<(KeyValue, Record)> {
    let mut record = normalize_row(shape, record)?;

    let key = match (field_value(&record, &shape.primary_key), shape.key_generation) {
        (Value::Null, Some(KeyGeneration::Sequence)) => {
            *sequence += 1;
            KeyValue::Int(*sequence)
        }
        (Value::Null, Some(KeyGeneration::Ulid)) => {
            KeyValue::Text(ulid::Ulid::new().to_string().to_lowercase())
        }
        _ => {
            let key = key_of(shape, &record)?;
            if let (KeyValue::Int(n), Some(KeyGeneration::Sequence)) = (&key, shape.key_generation)
            {
                *sequence = (*sequence).max(*n);
            }
            key
        }
    };
    record.insert(shape.primary_key.clone(), key.to_value());
    Ok((key, record))
}

/// Every non-null foreign key in `record` must name an existing parent row.
pub(crate) fn check_references(
    shape: &CollectionShape,
    record: &Record,
    source: &mut dyn RowSource,
) -> StorageResult<()> {
    for reference in &shape.references {
        let value = field_value(record, &reference.field);
        if value.is_null() {
            continue;
        }
        let key = KeyValue::from_value(value).ok_or_else(|| StorageError::SchemaViolation {
            collection: shape.name.clone(),
            reason: format!("{} is not a key value: {}", reference.field, value),
        })?;
        if !source.contains(&reference.parent, &key)? {
            return Err(StorageError::ForeignKeyViolation {
                collection: shape.name.clone(),
                field: reference.field.clone(),
                parent: reference.parent.clone(),
                key,
            });
        }
    }
    Ok(())
}

/// No row anywhere may still reference `collection/key`.
pub(crate) fn check_not_referenced(
    schema: &PhysicalSchema,
    collection: &str,
    key: &KeyValue,
    source: &mut dyn RowSource,
) -> StorageResult<()> {
    let wanted = key.to_value();
    for child in schema.values() {
        for reference in child.references.iter().filter(|r| r.parent == collection) {
            let referenced = source
                .rows(&child.name)?
                .iter()
                .any(|row| crate::catalog::values_equal(field_value(row, &reference.field), &wanted));
            if referenced {
                return Err(StorageError::StillReferenced {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    referrer: format!("{}.{}", child.name, reference.field),
                });
            }
        }
    }
    Ok(())
}

/// Row-level preconditions of a schema change, checked against the schema
/// as it was before the change.
pub(crate) fn check_change_rows(
    change: &SchemaChange,
    source: &mut dyn RowSource,
) -> StorageResult<()> {
    match change {
        SchemaChange::AddField { collection, field }
            if !field.is_nullable() && field.default_value().is_none() =>
        {
            if !source.rows(collection)?.is_empty() {
                return Err(StorageError::SchemaViolation {
                    collection: collection.clone(),
                    reason: format!(
                        "required field '{}' needs a default on a non-empty collection",
                        field.name
                    ),
                });
            }
        }
        SchemaChange::AddReference {
            collection,
            reference,
        } => {
            for row in source.rows(collection)? {
                let value = field_value(&row, &reference.field);
                let Some(key) = KeyValue::from_value(value) else {
                    continue;
                };
                if !source.contains(&reference.parent, &key)? {
                    return Err(StorageError::ForeignKeyViolation {
                        collection: collection.clone(),
                        field: reference.field.clone(),
                        parent: reference.parent.clone(),
                        key,
                    });
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Row rewrite implied by a field change, if any.
pub(crate) fn migrate_row(change: &SchemaChange, row: &mut Record) {
    match change {
        SchemaChange::AddField { field, .. } => {
            let value = field.default_value().cloned().unwrap_or(Value::Null);
            row.insert(field.name.clone(), value);
        }
        SchemaChange::DropField { field, .. } => {
            row.remove(&field.name);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::catalog::{DataType, FieldDef};
    use crate::storage::types::ForeignKeyRef;
    use serde_json::json;

    struct Rows(BTreeMap<String, Vec<Record>>);

    impl RowSource for Rows {
        fn contains(&mut self, collection: &str, key: &KeyValue) -> StorageResult<bool> {
            Ok(self
                .0
                .get(collection)
                .map(|rows| rows.iter().any(|r| KeyValue::from_value(&r["id"]).as_ref() == Some(key)))
                .unwrap_or(false))
        }

        fn rows(&mut self, collection: &str) -> StorageResult<Vec<Record>> {
            Ok(self.0.get(collection).cloned().unwrap_or_default())
        }
    }

    fn order_shape() -> CollectionShape {
        CollectionShape {
            name: "order".into(),
            fields: vec![
                FieldDef::new("id", DataType::Integer),
                FieldDef::required("qty", DataType::Integer),
                FieldDef::new("status", DataType::Text).with_default(json!("open")),
                FieldDef::new("customer_id", DataType::Integer),
            ],
            primary_key: "id".into(),
            key_generation: Some(KeyGeneration::Sequence),
            references: vec![ForeignKeyRef::new("customer_id", "customer")],
        }
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_prepare_insert_generates_key() {
        let mut seq = 0;
        let (key, row) =
            prepare_insert(&order_shape(), record(&[("qty", json!(2))]), &mut seq).unwrap();
        assert_eq!(key, KeyValue::Int(1));
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["status"], json!("open"));
        assert_eq!(row["customer_id"], Value::Null);

        let (key, _) = prepare_insert(
            &order_shape(),
            record(&[("id", json!(10)), ("qty", json!(1))]),
            &mut seq,
        )
        .unwrap();
        assert_eq!(key, KeyValue::Int(10));
        assert_eq!(seq, 10);
    }

    #[test]
    fn test_normalize_rejects_bad_rows() {
        let shape = order_shape();
        assert!(matches!(
            normalize_row(&shape, record(&[("qty", json!("two"))])),
            Err(StorageError::SchemaViolation { .. })
        ));
        assert!(matches!(
            normalize_row(&shape, record(&[])),
            Err(StorageError::SchemaViolation { .. })
        ));
        assert!(matches!(
            normalize_row(&shape, record(&[("qty", json!(1)), ("colour", json!("red"))])),
            Err(StorageError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_reference_checks() {
        let mut source = Rows(BTreeMap::from([(
            "customer".to_string(),
            vec![record(&[("id", json!(1))])],
        )]));
        let shape = order_shape();

        let ok = record(&[("id", json!(1)), ("qty", json!(1)), ("customer_id", json!(1))]);
        assert!(check_references(&shape, &ok, &mut source).is_ok());

        let dangling = record(&[("id", json!(2)), ("qty", json!(1)), ("customer_id", json!(9))]);
        assert!(matches!(
            check_references(&shape, &dangling, &mut source),
            Err(StorageError::ForeignKeyViolation { .. })
        ));

        source.0.insert("order".into(), vec![ok]);
        let schema = PhysicalSchema::from([("order".to_string(), shape)]);
        assert!(matches!(
            check_not_referenced(&schema, "customer", &KeyValue::Int(1), &mut source),
            Err(StorageError::StillReferenced { .. })
        ));
        assert!(check_not_referenced(&schema, "customer", &KeyValue::Int(2), &mut source).is_ok());
    }

    #[test]
    fn test_required_field_on_populated_collection() {
        let mut source = Rows(BTreeMap::from([(
            "order".to_string(),
            vec![record(&[("id", json!(1))])],
        )]));
        let change = SchemaChange::AddField {
            collection: "order".into(),
            field: FieldDef::required("priority", DataType::Integer),
        };
        assert!(check_change_rows(&change, &mut source).is_err());

        let with_default = SchemaChange::AddField {
            collection: "order".into(),
            field: FieldDef::required("priority", DataType::Integer).with_default(json!(0)),
        };
        assert!(check_change_rows(&with_default, &mut source).is_ok());

        let mut row = record(&[("id", json!(1))]);
        migrate_row(&with_default, &mut row);
        assert_eq!(row["priority"], json!(0));
    }
}
