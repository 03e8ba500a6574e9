//! Session-level behaviour against the in-process store.

mod common;

use std::sync::Arc;

use gitorm::catalog::{Catalog, DataType, KeyValue, RecordTypeBuilder};
use gitorm::db::{Database, DatabaseConfig};
use gitorm::query::{Predicate, SortDirection};
use gitorm::session::{LifecycleState, SessionError};
use gitorm::storage::{MemoryStore, StorageError, Store};
use serde_json::json;

use common::{customer, initial_step, order, shop_catalog};

/// A migrated database with two customers and three orders.
fn seeded() -> (Arc<MemoryStore>, Database) {
    let store = Arc::new(MemoryStore::new());
    let catalog = shop_catalog();
    let db = Database::with_store(store.clone(), catalog.clone(), DatabaseConfig::default())
        .with_migrations(vec![initial_step(&catalog)]);
    db.migrator().unwrap().apply_all().unwrap();

    let mut session = db.session().unwrap();
    let ada = session.register_new("customer", customer("Ada")).unwrap();
    let grace = session.register_new("customer", customer("Grace")).unwrap();
    let result = session.commit().unwrap();
    let ada_key = result.key_of(ada).unwrap().clone();
    let grace_key = result.key_of(grace).unwrap().clone();

    let (KeyValue::Int(a), KeyValue::Int(g)) = (ada_key, grace_key) else {
        panic!("expected integer keys");
    };
    session.register_new("order", order(5, a)).unwrap();
    session.register_new("order", order(2, a)).unwrap();
    session.register_new("order", order(8, g)).unwrap();
    session.commit().unwrap();
    (store, db)
}

#[test]
fn test_same_key_same_instance() {
    let (_, db) = seeded();
    let mut session = db.session().unwrap();

    let by_key = session.get("customer", 1i64).unwrap();
    let again = session.get("customer", 1i64).unwrap();
    let by_query = session
        .query("customer")
        .filter(Predicate::eq("name", "Ada"))
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(by_key, again);
    assert_eq!(by_key, by_query);
}

#[test]
fn test_edit_round_trip_is_unchanged() {
    let (_, db) = seeded();
    let mut session = db.session().unwrap();
    let order = session.get("order", 1i64).unwrap();

    session.set(order, "qty", 12).unwrap();
    assert_eq!(session.state(order).unwrap(), LifecycleState::Modified);
    session.set(order, "qty", 5).unwrap();
    assert_eq!(session.state(order).unwrap(), LifecycleState::Unchanged);
    assert!(!session.has_changes());
}

#[test]
fn test_mixed_batch_commit() {
    let (store, db) = seeded();
    let mut session = db.session().unwrap();

    let added = session.register_new("customer", customer("Linus")).unwrap();
    let modified = session.get("order", 1i64).unwrap();
    session.set(modified, "qty", 6).unwrap();
    let deleted = session.get("order", 3i64).unwrap();
    session.mark_deleted(deleted).unwrap();

    let result = session.commit().unwrap();
    assert_eq!(result.inserted.len(), 1);
    assert_eq!(result.updated, vec![modified]);
    assert_eq!(result.deleted, vec![deleted]);

    assert_eq!(session.state(added).unwrap(), LifecycleState::Unchanged);
    assert_eq!(session.key(added).unwrap(), Some(&KeyValue::Int(3)));
    assert_eq!(session.state(modified).unwrap(), LifecycleState::Unchanged);
    assert_eq!(session.state(deleted).unwrap(), LifecycleState::Detached);

    let remaining = session.query("order").execute().unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(!remaining.contains(&deleted));
    assert_eq!(
        store.fetch_by_key("order", &KeyValue::Int(1)).unwrap().unwrap()["qty"],
        json!(6)
    );
}

#[test]
fn test_concurrent_writer_conflict() {
    let (store, db) = seeded();
    let mut a = db.session().unwrap();
    let mut b = db.session().unwrap();

    let in_a = a.get("order", 1i64).unwrap();
    let in_b = b.get("order", 1i64).unwrap();
    assert_eq!(a.value(in_a, "qty").unwrap(), &json!(5));

    b.set(in_b, "qty", 7).unwrap();
    b.commit().unwrap();

    a.set(in_a, "qty", 9).unwrap();
    let err = a.commit().unwrap_err();
    assert!(matches!(err, SessionError::ConcurrencyConflict { ref key, .. } if *key == KeyValue::Int(1)));
    assert!(err.is_retryable());
    assert_eq!(a.state(in_a).unwrap(), LifecycleState::Modified);
    assert_eq!(
        store.fetch_by_key("order", &KeyValue::Int(1)).unwrap().unwrap()["qty"],
        json!(7)
    );
}

#[test]
fn test_include_costs_two_fetches() {
    let (store, db) = seeded();
    let mut session = db.session().unwrap();
    store.reset_stats();

    let customers = session
        .query("customer")
        .order_by("id", SortDirection::Ascending)
        .include("orders")
        .execute()
        .unwrap();
    for customer in &customers {
        session.related(*customer, "orders").unwrap();
    }
    assert_eq!(store.stats().fetches(), 2);
    assert_eq!(session.related(customers[0], "orders").unwrap().len(), 2);
    assert_eq!(session.related(customers[1], "orders").unwrap().len(), 1);
    assert_eq!(store.stats().fetches(), 2);
}

#[test]
fn test_lazy_loading_without_include() {
    let (store, db) = seeded();
    let mut session = db.session().unwrap();
    let customers = session.query("customer").execute().unwrap();
    store.reset_stats();

    for customer in &customers {
        session.related(*customer, "orders").unwrap();
    }
    assert_eq!(store.stats().fetches(), customers.len());

    session.close();
    assert!(matches!(
        session.query("order").execute(),
        Err(SessionError::DetachedSession(_))
    ));
}

#[test]
fn test_rejected_batch_keeps_states() {
    let (store, db) = seeded();
    let mut session = db.session().unwrap();

    let fine = session.register_new("customer", customer("Barbara")).unwrap();
    let orphan = session.register_new("order", order(1, 99)).unwrap();
    let err = session.commit().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Commit(StorageError::ForeignKeyViolation { .. })
    ));
    assert_eq!(session.state(fine).unwrap(), LifecycleState::Added);
    assert_eq!(session.state(orphan).unwrap(), LifecycleState::Added);
    assert_eq!(store.row_count("customer").unwrap(), 2);

    // fix the batch and retry
    session.set(orphan, "customer_id", 1).unwrap();
    session.commit().unwrap();
    assert_eq!(store.row_count("customer").unwrap(), 3);
}

#[test]
fn test_attach_to_unsaved_parent() {
    let (_, db) = seeded();
    let mut session = db.session().unwrap();

    let parent = session.register_new("customer", customer("Edsger")).unwrap();
    let child = session
        .register_new("order", gitorm::catalog::Record::from_iter([("qty".to_string(), json!(4))]))
        .unwrap();
    session.attach(child, "customer", parent).unwrap();
    let result = session.commit().unwrap();

    let parent_key = result.key_of(parent).unwrap().to_value();
    assert_eq!(session.value(child, "customer_id").unwrap(), &parent_key);
    assert_eq!(session.related_one(child, "customer").unwrap(), Some(parent));
}

#[test]
fn test_lazy_switch_from_config() {
    let store = Arc::new(MemoryStore::new());
    let catalog = shop_catalog();
    let db = Database::with_store(store, catalog.clone(), DatabaseConfig::default().lazy_loading(false))
        .with_migrations(vec![initial_step(&catalog)]);
    db.migrator().unwrap().apply_all().unwrap();

    let mut session = db.session().unwrap();
    let ada = session.register_new("customer", customer("Ada")).unwrap();
    session.commit().unwrap();

    let err = session.related(ada, "orders").unwrap_err();
    assert!(matches!(err, SessionError::LazyLoadingDisabled { .. }));
}

fn item_database() -> (Arc<MemoryStore>, Database) {
    let store = Arc::new(MemoryStore::new());
    let catalog = Catalog::builder()
        .register(
            RecordTypeBuilder::new("item")
                .key("id", DataType::Integer)
                .add_field("label", DataType::Text)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let db = Database::with_store(store.clone(), catalog.clone(), DatabaseConfig::default())
        .with_migrations(vec![initial_step(&catalog)]);
    db.migrator().unwrap().apply_all().unwrap();
    (store, db)
}

#[test]
fn test_key_edit_before_commit_moves_identity() {
    let (store, db) = item_database();
    let mut session = db.session().unwrap();

    let item = session.register_new("item", common::record(json!({ "id": 1 }))).unwrap();
    session.set(item, "id", 5).unwrap();
    assert_eq!(session.find("item", 1i64).unwrap(), None);
    assert_eq!(session.find("item", 5i64).unwrap(), Some(item));

    session.commit().unwrap();
    assert!(store.fetch_by_key("item", &KeyValue::Int(1)).unwrap().is_none());
    assert_eq!(session.find("item", 1i64).unwrap(), None);
    assert_eq!(session.find("item", 5i64).unwrap(), Some(item));
    assert_eq!(session.key(item).unwrap(), Some(&KeyValue::Int(5)));
}

#[test]
fn test_key_edit_onto_tracked_key_is_rejected() {
    let (_, db) = item_database();
    let mut session = db.session().unwrap();

    let first = session.register_new("item", common::record(json!({ "id": 1 }))).unwrap();
    let second = session.register_new("item", common::record(json!({ "id": 2 }))).unwrap();
    let err = session.set(second, "id", 1).unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));
    assert!(err.is_usage_error());
    assert_eq!(session.find("item", 1i64).unwrap(), Some(first));
    assert_eq!(session.find("item", 2i64).unwrap(), Some(second));

    let dup = session.register_new("item", common::record(json!({ "id": 2 }))).unwrap_err();
    assert!(matches!(dup, SessionError::InvalidState { instance, .. } if instance == second));
}
