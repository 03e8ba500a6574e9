//! Scalar types and field definitions for record types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar data types a record field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Text/string data.
    Text,
    /// Integer numbers (64-bit).
    Integer,
    /// Floating point numbers.
    Float,
    /// Boolean values.
    Boolean,
    /// JSON objects or arrays.
    Json,
    /// Timestamps (stored as ISO 8601 strings).
    Timestamp,
    /// UUIDs (stored as strings).
    Uuid,
}

impl DataType {
    /// Check if a JSON value matches this data type.
    ///
    /// `Null` never matches; nullability is a property of the field.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (DataType::Text, Value::String(_)) => true,
            (DataType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (DataType::Float, Value::Number(_)) => true,
            (DataType::Boolean, Value::Bool(_)) => true,
            (DataType::Json, Value::Object(_) | Value::Array(_)) => true,
            (DataType::Timestamp, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
                    || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
            }
            (DataType::Uuid, Value::String(s)) => {
                // 8-4-4-4-12
                s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4
            }
            _ => false,
        }
    }

    /// Whether values of this type have a meaningful ordering.
    pub fn is_orderable(&self) -> bool {
        !matches!(self, DataType::Json)
    }

    /// Whether this type can serve as a primary key.
    pub fn is_key_type(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Text | DataType::Uuid)
    }

    /// Get the canonical name for this type.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::Text => "TEXT",
            DataType::Integer => "INTEGER",
            DataType::Float => "REAL",
            DataType::Boolean => "BOOLEAN",
            DataType::Json => "JSON",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Uuid => "UUID",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Field constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Field cannot be null.
    NotNull,
    /// Field is the primary key (implies NotNull).
    PrimaryKey,
    /// Key value is assigned by the store on insert.
    Generated,
    /// Default value used when the field is absent.
    Default(Value),
}

impl Constraint {
    /// Check if this constraint forbids null.
    pub fn is_not_null(&self) -> bool {
        matches!(self, Constraint::NotNull | Constraint::PrimaryKey)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::NotNull => write!(f, "NOT NULL"),
            Constraint::PrimaryKey => write!(f, "PRIMARY KEY"),
            Constraint::Generated => write!(f, "GENERATED"),
            Constraint::Default(v) => write!(f, "DEFAULT {}", v),
        }
    }
}

/// Full field definition including name, type, and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Data type.
    pub data_type: DataType,
    /// Constraints on this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl FieldDef {
    /// Create a new nullable field definition.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            constraints: Vec::new(),
        }
    }

    /// Create a non-nullable field definition.
    pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type).with_constraint(Constraint::NotNull)
    }

    /// Add a constraint to this field.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
        }
        self
    }

    /// Set a default value.
    pub fn with_default(self, value: Value) -> Self {
        self.with_constraint(Constraint::Default(value))
    }

    /// Check if this field is nullable.
    pub fn is_nullable(&self) -> bool {
        !self.constraints.iter().any(|c| c.is_not_null())
    }

    /// Check if this field is marked as the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.constraints.contains(&Constraint::PrimaryKey)
    }

    /// Check if the store generates this field's value.
    pub fn is_generated(&self) -> bool {
        self.constraints.contains(&Constraint::Generated)
    }

    /// Get the default value, if any.
    pub fn default_value(&self) -> Option<&Value> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Default(v) => Some(v),
            _ => None,
        })
    }

    /// Validate a value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<(), String> {
        match value {
            Some(Value::Null) | None => {
                if !self.is_nullable() && self.default_value().is_none() {
                    return Err(format!("field '{}' cannot be null", self.name));
                }
                Ok(())
            }
            Some(v) => {
                if !self.data_type.matches(v) {
                    return Err(format!(
                        "field '{}' expects type {}, got {}",
                        self.name, self.data_type, v
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        for constraint in &self.constraints {
            write!(f, " {}", constraint)?;
        }
        Ok(())
    }
}
