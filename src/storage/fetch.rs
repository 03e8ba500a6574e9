//! Fetch requests and their in-process evaluation.

use crate::catalog::Record;
use crate::query::{compare_records, OrderBy, Predicate};

/// A predicate fetch against one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub filter: Option<Predicate>,
    pub order: Vec<OrderBy>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl FetchRequest {
    /// Fetch every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Predicate) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }
}

/// Evaluate a request over rows given in key order. Sorting is stable, so
/// rows with equal sort keys keep key order.
pub(crate) fn apply_request<I>(rows: I, request: &FetchRequest) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut matched: Vec<Record> = match &request.filter {
        Some(filter) => rows.into_iter().filter(|r| filter.matches(r)).collect(),
        None => rows.into_iter().collect(),
    };

    if !request.order.is_empty() {
        matched.sort_by(|a, b| compare_records(a, b, &request.order));
    }

    let limit = request.limit.unwrap_or(usize::MAX);
    matched
        .into_iter()
        .skip(request.offset)
        .take(limit)
        .collect()
}
