//! Eager loading of associations.
//!
//! Each hop of an include path costs one `IN` fetch for the whole result
//! set, no matter how many owners it has. Rows come back through the
//! identity map and the association caches of every owner are filled, so
//! later access through [`Session::related`] never goes to the store.

use std::collections::{HashMap, HashSet};

use crate::catalog::{Association, AssociationKind, Catalog, KeyValue, RecordType};
use crate::query::predicate::Predicate;
use crate::session::{InstanceId, Related, Session, SessionError, SessionResult};
use crate::storage::FetchRequest;

/// A resolved include path such as `orders.lines`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludePath {
    pub path: String,
    pub hops: Vec<Association>,
}

/// Resolve a dotted association path starting at `root`.
pub fn resolve_path(catalog: &Catalog, root: &RecordType, path: &str) -> SessionResult<IncludePath> {
    let mut hops = Vec::new();
    let mut current = root;
    for name in path.split('.') {
        let assoc = current
            .association(name.trim())
            .ok_or_else(|| SessionError::UnknownAssociation {
                record_type: current.name.clone(),
                association: name.to_string(),
            })?;
        current = catalog.describe(&assoc.target)?;
        hops.push(assoc.clone());
    }
    Ok(IncludePath {
        path: path.to_string(),
        hops,
    })
}

/// Load every hop of `path` for `owners`.
pub(crate) fn load_path(
    session: &mut Session,
    owners: &[InstanceId],
    path: &IncludePath,
) -> SessionResult<()> {
    let mut level = owners.to_vec();
    for assoc in &path.hops {
        if level.is_empty() {
            break;
        }
        level = match assoc.kind {
            AssociationKind::ToMany => load_many(session, &level, assoc)?,
            AssociationKind::ToOne => load_one(session, &level, assoc)?,
        };
    }
    Ok(())
}

fn is_cached(session: &Session, id: InstanceId, association: &str) -> SessionResult<bool> {
    Ok(session.instance(id)?.associations.contains_key(association))
}

/// Cached instances of `assoc` on `id`, for walking past an already loaded
/// hop.
fn cached(session: &Session, id: InstanceId, association: &str) -> Vec<InstanceId> {
    match session
        .instance(id)
        .ok()
        .and_then(|i| i.associations.get(association))
    {
        Some(Related::Many(children)) => children.clone(),
        Some(Related::One(parent)) => parent.iter().copied().collect(),
        None => Vec::new(),
    }
}

fn push_unique(out: &mut Vec<InstanceId>, seen: &mut HashSet<InstanceId>, id: InstanceId) {
    if seen.insert(id) {
        out.push(id);
    }
}

fn load_many(
    session: &mut Session,
    owners: &[InstanceId],
    assoc: &Association,
) -> SessionResult<Vec<InstanceId>> {
    let mut next = Vec::new();
    let mut seen = HashSet::new();
    let mut pending: Vec<(InstanceId, KeyValue)> = Vec::new();
    for &owner in owners {
        if is_cached(session, owner, &assoc.name)? {
            for child in cached(session, owner, &assoc.name) {
                push_unique(&mut next, &mut seen, child);
            }
            continue;
        }
        match session.instance(owner)?.key().cloned() {
            Some(key) => pending.push((owner, key)),
            None => session.cache_related(owner, &assoc.name, Related::Many(Vec::new())),
        }
    }
    if pending.is_empty() {
        return Ok(next);
    }

    let keys: Vec<_> = pending.iter().map(|(_, k)| k.to_value()).collect();
    let request = FetchRequest::filtered(Predicate::in_list(&assoc.foreign_key, keys));
    tracing::debug!(association = %assoc.name, owners = pending.len(), "include");
    let rows = session.store().fetch_by_predicate(&assoc.target, &request)?;

    let mut grouped: HashMap<KeyValue, Vec<InstanceId>> = HashMap::new();
    for row in rows {
        let child = session.materialize(&assoc.target, row)?;
        let parent_key = KeyValue::from_value(session.instance(child)?.get(&assoc.foreign_key));
        if let Some(parent_key) = parent_key {
            grouped.entry(parent_key).or_default().push(child);
        }
    }

    let catalog = session.catalog().clone();
    let back = catalog
        .describe(&assoc.target)?
        .to_one_for_field(&assoc.foreign_key)
        .map(|a| a.name.clone());
    for (owner, key) in pending {
        let children = grouped.remove(&key).unwrap_or_default();
        for &child in &children {
            if let Some(back) = &back {
                if !is_cached(session, child, back)? {
                    session.cache_related(child, back, Related::One(Some(owner)));
                }
            }
            push_unique(&mut next, &mut seen, child);
        }
        session.cache_related(owner, &assoc.name, Related::Many(children));
    }
    Ok(next)
}

fn load_one(
    session: &mut Session,
    owners: &[InstanceId],
    assoc: &Association,
) -> SessionResult<Vec<InstanceId>> {
    let mut next = Vec::new();
    let mut seen = HashSet::new();
    let mut pending: Vec<(InstanceId, Option<KeyValue>)> = Vec::new();
    for &owner in owners {
        if is_cached(session, owner, &assoc.name)? {
            for parent in cached(session, owner, &assoc.name) {
                push_unique(&mut next, &mut seen, parent);
            }
            continue;
        }
        let instance = session.instance(owner)?;
        if let Some(link) = instance.links.iter().find(|l| l.foreign_key == assoc.foreign_key) {
            let parent = link.parent;
            session.cache_related(owner, &assoc.name, Related::One(Some(parent)));
            push_unique(&mut next, &mut seen, parent);
            continue;
        }
        pending.push((owner, KeyValue::from_value(instance.get(&assoc.foreign_key))));
    }

    let mut missing: Vec<KeyValue> = pending
        .iter()
        .filter_map(|(_, key)| key.clone())
        .filter(|key| session.identity_map().lookup(&assoc.target, key).is_none())
        .collect();
    missing.sort();
    missing.dedup();
    if !missing.is_empty() {
        let catalog = session.catalog().clone();
        let target = catalog.describe(&assoc.target)?;
        let keys: Vec<_> = missing.iter().map(KeyValue::to_value).collect();
        let request = FetchRequest::filtered(Predicate::in_list(&target.primary_key, keys));
        tracing::debug!(association = %assoc.name, parents = missing.len(), "include");
        let rows = session.store().fetch_by_predicate(&target.name, &request)?;
        for row in rows {
            session.materialize(&target.name, row)?;
        }
    }

    for (owner, key) in pending {
        let parent = key.and_then(|k| session.identity_map().lookup(&assoc.target, &k));
        session.cache_related(owner, &assoc.name, Related::One(parent));
        if let Some(parent) = parent {
            push_unique(&mut next, &mut seen, parent);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{DataType, Record, RecordTypeBuilder};
    use crate::query::SortDirection;
    use crate::session::SessionOptions;
    use crate::storage::{CollectionShape, ForeignKeyRef, MemoryStore, SchemaChange, Store};
    use serde_json::json;

    fn catalog() -> Catalog {
        Catalog::builder()
            .register(
                RecordTypeBuilder::new("customer")
                    .key("id", DataType::Integer)
                    .add_required_field("name", DataType::Text)
                    .to_many("orders", "order", "customer_id")
                    .build()
                    .unwrap(),
            )
            .register(
                RecordTypeBuilder::new("order")
                    .key("id", DataType::Integer)
                    .add_field("qty", DataType::Integer)
                    .add_field("customer_id", DataType::Integer)
                    .to_one("customer", "customer", "customer_id")
                    .to_many("lines", "line", "order_id")
                    .build()
                    .unwrap(),
            )
            .register(
                RecordTypeBuilder::new("line")
                    .key("id", DataType::Integer)
                    .add_field("sku", DataType::Text)
                    .add_field("order_id", DataType::Integer)
                    .to_one("order", "order", "order_id")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        let catalog = catalog();
        let mut tx = store.begin().unwrap();
        for name in catalog.dependency_order() {
            let rt = catalog.describe(name).unwrap();
            tx.alter(&SchemaChange::CreateCollection {
                shape: CollectionShape {
                    name: rt.name.clone(),
                    fields: rt.fields.clone(),
                    primary_key: rt.primary_key.clone(),
                    key_generation: None,
                    references: catalog
                        .references_from(name)
                        .map(|r| ForeignKeyRef::new(&r.foreign_key, &r.parent))
                        .collect(),
                },
            })
            .unwrap();
        }
        let row = |v: serde_json::Value| -> Record { serde_json::from_value(v).unwrap() };
        tx.insert("customer", row(json!({"id": 1, "name": "Ada"}))).unwrap();
        tx.insert("customer", row(json!({"id": 2, "name": "Grace"}))).unwrap();
        tx.insert("customer", row(json!({"id": 3, "name": "Linus"}))).unwrap();
        for (id, qty, customer) in [(10, 1, 1), (11, 5, 1), (12, 2, 2)] {
            tx.insert("order", row(json!({"id": id, "qty": qty, "customer_id": customer})))
                .unwrap();
        }
        tx.insert("order", row(json!({"id": 13, "qty": 9, "customer_id": null})))
            .unwrap();
        for (id, sku, order) in [(100, "a", 10), (101, "b", 10), (102, "c", 12)] {
            tx.insert("line", row(json!({"id": id, "sku": sku, "order_id": order})))
                .unwrap();
        }
        tx.commit().unwrap();
        Arc::new(store)
    }

    fn no_lazy(store: Arc<MemoryStore>) -> Session {
        Session::with_options(store, catalog(), SessionOptions { lazy_loading: false })
    }

    #[test]
    fn test_include_to_many_is_one_fetch() {
        let store = seeded();
        let mut session = no_lazy(store.clone());
        store.reset_stats();

        let customers = session
            .query("customer")
            .order_by("id", SortDirection::Ascending)
            .include("orders")
            .execute()
            .unwrap();
        assert_eq!(store.stats().fetches(), 2);

        assert_eq!(session.related(customers[0], "orders").unwrap().len(), 2);
        assert_eq!(session.related(customers[1], "orders").unwrap().len(), 1);
        assert!(session.related(customers[2], "orders").unwrap().is_empty());

        // inverse side is filled in as well
        let orders = session.related(customers[0], "orders").unwrap();
        assert_eq!(
            session.related_one(orders[0], "customer").unwrap(),
            Some(customers[0])
        );
        assert_eq!(store.stats().fetches(), 2);
    }

    #[test]
    fn test_include_to_one_with_null_key() {
        let store = seeded();
        let mut session = no_lazy(store.clone());
        store.reset_stats();

        let orders = session
            .query("order")
            .order_by("id", SortDirection::Ascending)
            .include("customer")
            .execute()
            .unwrap();
        assert_eq!(orders.len(), 4);
        assert_eq!(store.stats().fetches(), 2);

        let first = session.related_one(orders[0], "customer").unwrap().unwrap();
        let second = session.related_one(orders[1], "customer").unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(session.related_one(orders[3], "customer").unwrap(), None);
    }

    #[test]
    fn test_nested_path() {
        let store = seeded();
        let mut session = no_lazy(store.clone());
        store.reset_stats();

        let customers = session
            .query("customer")
            .filter(Predicate::eq("id", 1))
            .include("orders.lines")
            .execute()
            .unwrap();
        assert_eq!(store.stats().fetches(), 3);

        let orders = session.related(customers[0], "orders").unwrap();
        let lines: usize = orders
            .iter()
            .map(|o| session.related(*o, "lines").unwrap().len())
            .sum();
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_unknown_path_fails_before_fetch() {
        let store = seeded();
        let mut session = no_lazy(store.clone());
        store.reset_stats();

        let err = session.query("customer").include("orders.refunds").execute().unwrap_err();
        assert!(matches!(err, SessionError::UnknownAssociation { .. }));
        assert_eq!(store.stats().fetches(), 0);
    }

    #[test]
    fn test_resolve_path() {
        let catalog = catalog();
        let root = catalog.describe("line").unwrap();
        let path = resolve_path(&catalog, root, "order.customer.orders").unwrap();
        let names: Vec<_> = path.hops.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["order", "customer", "orders"]);
    }
}
