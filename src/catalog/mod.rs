//! Schema catalog: static metadata for every record type.
//!
//! Definitions are declared once, validated as a whole (associations,
//! foreign keys, ownership cycles) and frozen into a [`Catalog`] that the
//! session, query and migration layers share.

mod manager;
mod schema;
mod types;
mod value;

pub use manager::{Catalog, CatalogBuilder, Reference};
pub use schema::{Association, AssociationKind, RecordType, RecordTypeBuilder, SchemaError};
pub use types::{Constraint, DataType, FieldDef};
pub use value::{compare_values, field_value, values_equal, KeyValue, Record};
