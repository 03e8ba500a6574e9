//! Record type definitions and validation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Constraint, DataType, FieldDef};
use super::value::{KeyValue, Record};

/// Direction of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    /// The owning type holds a nullable foreign key to the target.
    ToOne,
    /// The target type holds a foreign key back to the owning type.
    ToMany,
}

/// A declared association between two record types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    /// Association name, used in `include` paths and lazy access.
    pub name: String,
    /// Direction.
    pub kind: AssociationKind,
    /// Name of the related record type.
    pub target: String,
    /// Foreign-key field. For `ToOne` it lives on the owning type, for
    /// `ToMany` on the target type.
    pub foreign_key: String,
}

impl Association {
    /// Create a to-one association.
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::ToOne,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    /// Create a to-many association.
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::ToMany,
            target: target.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn is_to_many(&self) -> bool {
        self.kind == AssociationKind::ToMany
    }
}

/// A named record shape: fields, one primary key, and associations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    /// Type name (also the store collection name).
    pub name: String,
    /// Field definitions, in declaration order.
    pub fields: Vec<FieldDef>,
    /// Primary key field name.
    pub primary_key: String,
    /// Declared associations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<Association>,
    /// Description/comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RecordType {
    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Get field names in declaration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Get an association by name.
    pub fn association(&self, name: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// The primary key field definition.
    pub fn key_field(&self) -> Result<&FieldDef, SchemaError> {
        self.field(&self.primary_key)
            .ok_or_else(|| SchemaError::InvalidPrimaryKey(self.primary_key.clone()))
    }

    /// Whether the store assigns keys for this type.
    pub fn has_generated_key(&self) -> bool {
        self.field(&self.primary_key)
            .map(|f| f.is_generated())
            .unwrap_or(false)
    }

    /// The to-one association whose foreign key is `field`, if any.
    pub fn to_one_for_field(&self, field: &str) -> Option<&Association> {
        self.associations
            .iter()
            .find(|a| a.kind == AssociationKind::ToOne && a.foreign_key == field)
    }

    /// Extract the primary key from a record.
    pub fn key_of(&self, record: &Record) -> Option<KeyValue> {
        record.get(&self.primary_key).and_then(KeyValue::from_value)
    }

    /// Validate the definition on its own (cross-type checks live in the
    /// catalog).
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_identifier(&self.name)?;

        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_identifier(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    record_type: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if field.is_primary_key() && field.name != self.primary_key {
                return Err(SchemaError::InvalidPrimaryKey(field.name.clone()));
            }
            if field.is_generated() && field.name != self.primary_key {
                return Err(SchemaError::InvalidKeyGeneration(format!(
                    "{}.{} is not the primary key",
                    self.name, field.name
                )));
            }
        }

        let key = self.key_field()?;
        if !key.data_type.is_key_type() {
            return Err(SchemaError::InvalidPrimaryKey(format!(
                "{}.{} has non-key type {}",
                self.name, key.name, key.data_type
            )));
        }
        if key.is_generated() && !matches!(key.data_type, DataType::Integer | DataType::Text) {
            return Err(SchemaError::InvalidKeyGeneration(format!(
                "{}.{}: only INTEGER and TEXT keys can be generated",
                self.name, key.name
            )));
        }

        let mut assoc_names = HashSet::new();
        for assoc in &self.associations {
            if !assoc_names.insert(assoc.name.as_str()) || seen.contains(assoc.name.as_str()) {
                return Err(SchemaError::DuplicateAssociation {
                    record_type: self.name.clone(),
                    association: assoc.name.clone(),
                });
            }
            if assoc.kind == AssociationKind::ToOne {
                let fk = self.field(&assoc.foreign_key).ok_or_else(|| {
                    SchemaError::InvalidForeignKey {
                        record_type: self.name.clone(),
                        association: assoc.name.clone(),
                        reason: format!("field '{}' is not declared", assoc.foreign_key),
                    }
                })?;
                if fk.name == self.primary_key {
                    return Err(SchemaError::InvalidForeignKey {
                        record_type: self.name.clone(),
                        association: assoc.name.clone(),
                        reason: "the primary key cannot be a foreign key".into(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Fill in declared defaults for absent fields.
    pub fn apply_defaults(&self, record: &mut Record) {
        for field in &self.fields {
            if !record.contains_key(&field.name) {
                let value = field.default_value().cloned().unwrap_or(Value::Null);
                record.insert(field.name.clone(), value);
            }
        }
    }

    /// Validate a record's values against this type. A null generated key
    /// is accepted; the store assigns it.
    pub fn validate_record(&self, record: &Record) -> Result<(), SchemaError> {
        for name in record.keys() {
            if self.field(name).is_none() {
                return Err(SchemaError::FieldNotFound {
                    record_type: self.name.clone(),
                    field: name.clone(),
                });
            }
        }
        for field in &self.fields {
            let value = record.get(&field.name);
            if field.is_generated() && value.map(Value::is_null).unwrap_or(true) {
                continue;
            }
            field.validate(value).map_err(SchemaError::InvalidValue)?;
        }
        Ok(())
    }
}

/// Names are used as store collection and field names. A leading
/// underscore is reserved for store metadata.
fn validate_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);
    if !valid_start
        || name.len() > 64
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SchemaError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Schema-related errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown record type: {0}")]
    UnknownType(String),

    #[error("record type already declared: {0}")]
    DuplicateType(String),

    #[error("invalid name: '{0}'")]
    InvalidName(String),

    #[error("duplicate field {record_type}.{field}")]
    DuplicateField { record_type: String, field: String },

    #[error("field not found: {record_type}.{field}")]
    FieldNotFound { record_type: String, field: String },

    #[error("invalid primary key: {0}")]
    InvalidPrimaryKey(String),

    #[error("invalid key generation: {0}")]
    InvalidKeyGeneration(String),

    #[error("duplicate association {record_type}.{association}")]
    DuplicateAssociation {
        record_type: String,
        association: String,
    },

    #[error("association {record_type}.{association} targets unknown type '{target}'")]
    UnknownAssociationTarget {
        record_type: String,
        association: String,
        target: String,
    },

    #[error("invalid foreign key for {record_type}.{association}: {reason}")]
    InvalidForeignKey {
        record_type: String,
        association: String,
        reason: String,
    },

    #[error("cyclic ownership: {}", .0.join(" -> "))]
    CyclicOwnership(Vec<String>),

    #[error("cannot remove primary key field: {0}")]
    CannotRemovePrimaryKey(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Builder for record type definitions.
pub struct RecordTypeBuilder {
    name: String,
    fields: Vec<FieldDef>,
    primary_key: Option<String>,
    associations: Vec<Association>,
    description: Option<String>,
}

impl RecordTypeBuilder {
    /// Start building a new record type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            primary_key: None,
            associations: Vec::new(),
            description: None,
        }
    }

    /// Declare the primary key field.
    pub fn key(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        self.fields
            .push(FieldDef::new(name.clone(), data_type).with_constraint(Constraint::PrimaryKey));
        self.primary_key = Some(name);
        self
    }

    /// Declare a primary key whose value the store assigns on insert.
    pub fn generated_key(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        self.fields.push(
            FieldDef::new(name.clone(), data_type)
                .with_constraint(Constraint::PrimaryKey)
                .with_constraint(Constraint::Generated),
        );
        self.primary_key = Some(name);
        self
    }

    /// Add a field definition.
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a nullable field.
    pub fn add_field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields.push(FieldDef::new(name, data_type));
        self
    }

    /// Add a non-nullable field.
    pub fn add_required_field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields.push(FieldDef::required(name, data_type));
        self
    }

    /// Declare a to-one association backed by `foreign_key` on this type.
    pub fn to_one(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations
            .push(Association::to_one(name, target, foreign_key));
        self
    }

    /// Declare a to-many association backed by `foreign_key` on the target.
    pub fn to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associations
            .push(Association::to_many(name, target, foreign_key));
        self
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Build the record type.
    pub fn build(self) -> Result<RecordType, SchemaError> {
        let primary_key = self
            .primary_key
            .ok_or_else(|| SchemaError::InvalidPrimaryKey(format!("{} has no key", self.name)))?;
        let record_type = RecordType {
            name: self.name,
            fields: self.fields,
            primary_key,
            associations: self.associations,
            description: self.description,
        };
        record_type.validate()?;
        Ok(record_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_type() -> RecordType {
        RecordTypeBuilder::new("order")
            .generated_key("id", DataType::Integer)
            .add_required_field("qty", DataType::Integer)
            .add_field("note", DataType::Text)
            .add_field("customer_id", DataType::Integer)
            .to_one("customer", "customer", "customer_id")
            .description("Customer orders")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_valid_type() {
        let rt = sample_type();
        assert_eq!(rt.primary_key, "id");
        assert!(rt.has_generated_key());
        assert_eq!(rt.field_names(), vec!["id", "qty", "note", "customer_id"]);
        assert_eq!(
            rt.to_one_for_field("customer_id").map(|a| a.name.as_str()),
            Some("customer")
        );
    }

    #[test]
    fn test_duplicate_field() {
        let result = RecordTypeBuilder::new("bad")
            .key("id", DataType::Integer)
            .add_field("name", DataType::Text)
            .add_field("name", DataType::Integer)
            .build();
        assert!(matches!(result, Err(SchemaError::DuplicateField { .. })));
    }

    #[test]
    fn test_missing_key() {
        let result = RecordTypeBuilder::new("bad")
            .add_field("name", DataType::Text)
            .build();
        assert!(matches!(result, Err(SchemaError::InvalidPrimaryKey(_))));
    }

    #[test]
    fn test_generated_key_type() {
        let result = RecordTypeBuilder::new("bad")
            .generated_key("id", DataType::Uuid)
            .build();
        assert!(matches!(result, Err(SchemaError::InvalidKeyGeneration(_))));
    }

    #[test]
    fn test_to_one_requires_local_field() {
        let result = RecordTypeBuilder::new("order")
            .key("id", DataType::Integer)
            .to_one("customer", "customer", "customer_id")
            .build();
        assert!(matches!(result, Err(SchemaError::InvalidForeignKey { .. })));
    }

    #[test]
    fn test_association_name_clash() {
        let result = RecordTypeBuilder::new("order")
            .key("id", DataType::Integer)
            .add_field("customer", DataType::Integer)
            .to_one("customer", "customer", "customer")
            .build();
        assert!(matches!(result, Err(SchemaError::DuplicateAssociation { .. })));
    }

    #[test]
    fn test_invalid_names() {
        assert!(RecordTypeBuilder::new("9lives")
            .key("id", DataType::Integer)
            .build()
            .is_err());
        assert!(RecordTypeBuilder::new("ok")
            .key("id", DataType::Integer)
            .add_field("a-b", DataType::Text)
            .build()
            .is_err());
    }

    #[test]
    fn test_record_validation() {
        let rt = sample_type();

        let mut record = Record::new();
        record.insert("qty".into(), json!(3));
        rt.apply_defaults(&mut record);
        assert!(rt.validate_record(&record).is_ok());
        assert_eq!(record.get("note"), Some(&Value::Null));

        record.insert("qty".into(), json!("three"));
        assert!(matches!(
            rt.validate_record(&record),
            Err(SchemaError::InvalidValue(_))
        ));

        let mut stray = Record::new();
        stray.insert("qty".into(), json!(1));
        stray.insert("colour".into(), json!("red"));
        assert!(matches!(
            rt.validate_record(&stray),
            Err(SchemaError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_schema_serialization() {
        let rt = sample_type();
        let json = serde_json::to_string_pretty(&rt).unwrap();
        let restored: RecordType = serde_json::from_str(&json).unwrap();
        assert_eq!(rt, restored);
    }
}
