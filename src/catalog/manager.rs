//! The catalog: an immutable registry of record types.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::schema::{AssociationKind, RecordType, SchemaError};
use super::types::DataType;

/// A foreign-key edge between two record types: rows of `child` carry
/// `foreign_key`, which holds a key of `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub child: String,
    pub foreign_key: String,
    pub parent: String,
}

/// The schema catalog.
///
/// Built once through [`CatalogBuilder`] and immutable afterwards. Cloning is
/// cheap; all clones share the same definitions.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    types: Vec<RecordType>,
    index: HashMap<String, usize>,
    references: Vec<Reference>,
    /// Position in dependency order, parents first.
    rank: HashMap<String, usize>,
    dependency_order: Vec<String>,
}

impl Catalog {
    /// Start declaring a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Build a catalog directly from a list of definitions.
    pub fn from_types(types: Vec<RecordType>) -> Result<Self, SchemaError> {
        types
            .into_iter()
            .fold(CatalogBuilder::default(), CatalogBuilder::register)
            .build()
    }

    /// Look up a record type.
    pub fn describe(&self, name: &str) -> Result<&RecordType, SchemaError> {
        self.inner
            .index
            .get(name)
            .map(|&i| &self.inner.types[i])
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    /// All record types, in declaration order.
    pub fn all_types(&self) -> &[RecordType] {
        &self.inner.types
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.index.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.types.is_empty()
    }

    /// Every foreign-key edge declared by any association, deduplicated.
    pub fn references(&self) -> &[Reference] {
        &self.inner.references
    }

    /// Foreign-key edges whose child is `name`.
    pub fn references_from<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Reference> {
        self.inner.references.iter().filter(move |r| r.child == name)
    }

    /// Type names ordered so that every referenced type precedes the types
    /// referring to it.
    pub fn dependency_order(&self) -> &[String] {
        &self.inner.dependency_order
    }

    /// Position of a type in [`Self::dependency_order`]. Unknown types sort
    /// last.
    pub fn rank(&self, name: &str) -> usize {
        self.inner.rank.get(name).copied().unwrap_or(usize::MAX)
    }
}

/// Collects record type definitions and validates them as a whole.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    types: Vec<RecordType>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type.
    pub fn register(mut self, record_type: RecordType) -> Self {
        self.types.push(record_type);
        self
    }

    /// Validate all definitions and freeze the catalog.
    pub fn build(self) -> Result<Catalog, SchemaError> {
        let mut index = HashMap::new();
        for (i, rt) in self.types.iter().enumerate() {
            rt.validate()?;
            if index.insert(rt.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateType(rt.name.clone()));
            }
        }

        let references = collect_references(&self.types, &index)?;
        let dependency_order = dependency_order(&self.types, &references)?;
        let rank = dependency_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        tracing::debug!(
            types = self.types.len(),
            references = references.len(),
            "catalog built"
        );

        Ok(Catalog {
            inner: Arc::new(CatalogInner {
                types: self.types,
                index,
                references,
                rank,
                dependency_order,
            }),
        })
    }
}

/// Key types that can hold each other's values.
fn key_types_compatible(a: DataType, b: DataType) -> bool {
    let text_like = |t| matches!(t, DataType::Text | DataType::Uuid);
    a == b || (text_like(a) && text_like(b))
}

fn collect_references(
    types: &[RecordType],
    index: &HashMap<String, usize>,
) -> Result<Vec<Reference>, SchemaError> {
    let mut references = BTreeSet::new();
    let mut to_many_owners: HashMap<(String, String), String> = HashMap::new();

    for rt in types {
        for assoc in &rt.associations {
            let target = index.get(&assoc.target).map(|&i| &types[i]).ok_or_else(|| {
                SchemaError::UnknownAssociationTarget {
                    record_type: rt.name.clone(),
                    association: assoc.name.clone(),
                    target: assoc.target.clone(),
                }
            })?;

            let (child, parent) = match assoc.kind {
                AssociationKind::ToOne => (rt, target),
                AssociationKind::ToMany => (target, rt),
            };
            let invalid = |reason: String| SchemaError::InvalidForeignKey {
                record_type: rt.name.clone(),
                association: assoc.name.clone(),
                reason,
            };

            let fk = child.field(&assoc.foreign_key).ok_or_else(|| {
                invalid(format!(
                    "field '{}' is not declared on '{}'",
                    assoc.foreign_key, child.name
                ))
            })?;
            if fk.name == child.primary_key {
                return Err(invalid(format!(
                    "'{}.{}' is the primary key",
                    child.name, fk.name
                )));
            }
            let parent_key = parent.key_field()?;
            if !key_types_compatible(fk.data_type, parent_key.data_type) {
                return Err(invalid(format!(
                    "'{}.{}' is {} but '{}' keys are {}",
                    child.name, fk.name, fk.data_type, parent.name, parent_key.data_type
                )));
            }

            if assoc.kind == AssociationKind::ToMany {
                let owner_key = (child.name.clone(), fk.name.clone());
                if let Some(previous) = to_many_owners.insert(owner_key, rt.name.clone()) {
                    return Err(invalid(format!(
                        "'{}.{}' is already owned by a to-many association on '{}'",
                        child.name, fk.name, previous
                    )));
                }
            }

            references.insert(Reference {
                child: child.name.clone(),
                foreign_key: fk.name.clone(),
                parent: parent.name.clone(),
            });
        }
    }

    // A foreign key field points at exactly one parent type.
    let mut seen: HashMap<(&str, &str), &str> = HashMap::new();
    for r in &references {
        if let Some(other) = seen.insert((r.child.as_str(), r.foreign_key.as_str()), r.parent.as_str()) {
            if other != r.parent {
                return Err(SchemaError::InvalidForeignKey {
                    record_type: r.child.clone(),
                    association: r.foreign_key.clone(),
                    reason: format!("refers to both '{}' and '{}'", other, r.parent),
                });
            }
        }
    }

    Ok(references.into_iter().collect())
}

/// Depth-first topological sort over child -> parent edges. Any cycle,
/// including a type referring to itself, leaves deletion order undefined and
/// is rejected with the offending path.
fn dependency_order(
    types: &[RecordType],
    references: &[Reference],
) -> Result<Vec<String>, SchemaError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Err(SchemaError::CyclicOwnership(cycle));
            }
            Mark::Unvisited => {}
        }

        marks.insert(name, Mark::InProgress);
        stack.push(name);
        for &parent in edges.get(name).into_iter().flatten() {
            visit(parent, edges, marks, stack, order)?;
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for r in references {
        edges.entry(&r.child).or_default().push(&r.parent);
    }

    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(types.len());
    let mut stack = Vec::new();
    for rt in types {
        visit(&rt.name, &edges, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::RecordTypeBuilder;

    fn customer() -> RecordType {
        RecordTypeBuilder::new("customer")
            .generated_key("id", DataType::Integer)
            .add_required_field("name", DataType::Text)
            .to_many("orders", "order", "customer_id")
            .build()
            .unwrap()
    }

    fn order() -> RecordType {
        RecordTypeBuilder::new("order")
            .generated_key("id", DataType::Integer)
            .add_required_field("qty", DataType::Integer)
            .add_field("customer_id", DataType::Integer)
            .to_one("customer", "customer", "customer_id")
            .build()
            .unwrap()
    }

    #[test]
    fn test_describe_and_unknown_type() {
        let catalog = Catalog::from_types(vec![order(), customer()]).unwrap();
        assert_eq!(catalog.describe("customer").unwrap().name, "customer");
        assert_eq!(
            catalog.describe("invoice").unwrap_err(),
            SchemaError::UnknownType("invoice".into())
        );
        let names: Vec<_> = catalog.all_types().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["order", "customer"]);
    }

    #[test]
    fn test_mutual_association_is_one_reference() {
        let catalog = Catalog::from_types(vec![customer(), order()]).unwrap();
        assert_eq!(
            catalog.references(),
            &[Reference {
                child: "order".into(),
                foreign_key: "customer_id".into(),
                parent: "customer".into(),
            }]
        );
    }

    #[test]
    fn test_dependency_order_parents_first() {
        let catalog = Catalog::from_types(vec![order(), customer()]).unwrap();
        assert_eq!(catalog.dependency_order(), &["customer", "order"]);
        assert!(catalog.rank("customer") < catalog.rank("order"));
    }

    #[test]
    fn test_duplicate_type() {
        let result = Catalog::from_types(vec![customer(), customer()]);
        assert!(matches!(result, Err(SchemaError::DuplicateType(_))));
    }

    #[test]
    fn test_unknown_target() {
        let result = Catalog::from_types(vec![customer()]);
        assert!(matches!(
            result,
            Err(SchemaError::UnknownAssociationTarget { .. })
        ));
    }

    #[test]
    fn test_foreign_key_type_mismatch() {
        let bad_order = RecordTypeBuilder::new("order")
            .key("id", DataType::Integer)
            .add_field("customer_id", DataType::Boolean)
            .to_one("customer", "customer", "customer_id")
            .build()
            .unwrap();
        let result = Catalog::from_types(vec![customer(), bad_order]);
        assert!(matches!(result, Err(SchemaError::InvalidForeignKey { .. })));
    }

    #[test]
    fn test_duplicate_to_many_ownership() {
        let greedy = RecordTypeBuilder::new("customer")
            .key("id", DataType::Integer)
            .to_many("orders", "order", "customer_id")
            .to_many("purchases", "order", "customer_id")
            .build()
            .unwrap();
        let result = Catalog::from_types(vec![greedy, order()]);
        assert!(matches!(result, Err(SchemaError::InvalidForeignKey { .. })));
    }

    #[test]
    fn test_cyclic_ownership_rejected() {
        let a = RecordTypeBuilder::new("a")
            .key("id", DataType::Integer)
            .add_field("b_id", DataType::Integer)
            .to_one("b", "b", "b_id")
            .build()
            .unwrap();
        let b = RecordTypeBuilder::new("b")
            .key("id", DataType::Integer)
            .to_many("owned", "a", "b_id")
            .add_field("a_id", DataType::Integer)
            .to_one("a", "a", "a_id")
            .build()
            .unwrap();

        match Catalog::from_types(vec![a, b]) {
            Err(SchemaError::CyclicOwnership(path)) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("expected cyclic ownership, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_rejected() {
        let node = RecordTypeBuilder::new("node")
            .key("id", DataType::Integer)
            .add_field("parent_id", DataType::Integer)
            .to_one("parent", "node", "parent_id")
            .build()
            .unwrap();
        let result = Catalog::from_types(vec![node]);
        assert!(matches!(result, Err(SchemaError::CyclicOwnership(_))));
    }
}
