#![allow(dead_code)]

use gitorm::catalog::{Catalog, DataType, Record, RecordTypeBuilder};
use gitorm::migration::{declared_schema, diff, MigrationStep};
use gitorm::storage::PhysicalSchema;
use serde_json::json;

/// customer 1..* order, order 1..* line
pub fn shop_catalog() -> Catalog {
    Catalog::builder()
        .register(
            RecordTypeBuilder::new("customer")
                .generated_key("id", DataType::Integer)
                .add_required_field("name", DataType::Text)
                .to_many("orders", "order", "customer_id")
                .build()
                .unwrap(),
        )
        .register(
            RecordTypeBuilder::new("order")
                .generated_key("id", DataType::Integer)
                .add_required_field("qty", DataType::Integer)
                .add_field("customer_id", DataType::Integer)
                .to_one("customer", "customer", "customer_id")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

/// A single step creating the whole catalog from nothing.
pub fn initial_step(catalog: &Catalog) -> MigrationStep {
    let changes = diff(&PhysicalSchema::new(), &declared_schema(catalog)).unwrap();
    MigrationStep::new("001_initial", changes)
}

pub fn record(value: serde_json::Value) -> Record {
    serde_json::from_value(value).unwrap()
}

pub fn customer(name: &str) -> Record {
    record(json!({ "name": name }))
}

pub fn order(qty: i64, customer_id: i64) -> Record {
    record(json!({ "qty": qty, "customer_id": customer_id }))
}
