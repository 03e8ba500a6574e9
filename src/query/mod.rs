//! Query engine: predicates, ordering, the query builder and eager
//! includes.

mod builder;
mod include;
mod order;
mod predicate;

pub use builder::Query;
pub use include::{resolve_path, IncludePath};
pub use order::{compare_records, OrderBy, SortDirection};
pub use predicate::{CompareOp, Predicate};
