//! Query builder and execution.

use crate::catalog::{DataType, RecordType, SchemaError};
use crate::query::include::{self, IncludePath};
use crate::query::order::{OrderBy, SortDirection};
use crate::query::predicate::{CompareOp, Predicate};
use crate::session::{InstanceId, Session, SessionError, SessionResult};
use crate::storage::{FetchRequest, StoreCapabilities};

/// A declarative query over one record type.
///
/// ```no_run
/// # use gitorm::query::{Predicate, SortDirection};
/// # fn demo(session: &mut gitorm::session::Session) -> gitorm::session::SessionResult<()> {
/// let big_orders = session
///     .query("order")
///     .filter(Predicate::gt("qty", 5))
///     .order_by("qty", SortDirection::Descending)
///     .include("customer")
///     .limit(10)
///     .execute()?;
/// # Ok(())
/// # }
/// ```
#[must_use = "a query does nothing until executed"]
pub struct Query<'s> {
    session: &'s mut Session,
    record_type: String,
    filter: Option<Predicate>,
    order: Vec<OrderBy>,
    includes: Vec<String>,
    limit: Option<usize>,
    offset: usize,
}

impl<'s> Query<'s> {
    pub(crate) fn new(session: &'s mut Session, record_type: &str) -> Self {
        Self {
            session,
            record_type: record_type.to_string(),
            filter: None,
            order: Vec::new(),
            includes: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Add a filter. Repeated filters are combined with AND.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(OrderBy::new(field, direction));
        self
    }

    /// Eagerly load an association, or a dotted path of them
    /// (`"orders.lines"`).
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    /// Run the query. Every row goes through the identity map, so rows
    /// already tracked come back as the same instances.
    pub fn execute(self) -> SessionResult<Vec<InstanceId>> {
        let Query {
            session,
            record_type,
            filter,
            order,
            includes,
            limit,
            offset,
        } = self;

        session.ensure_open()?;
        let catalog = session.catalog().clone();
        let rt = catalog.describe(&record_type)?;
        let capabilities = session.store().capabilities();

        if let Some(filter) = &filter {
            check_predicate(rt, &capabilities, filter)?;
        }
        check_order(rt, &capabilities, &order)?;
        if (limit.is_some() || offset > 0) && !capabilities.paging {
            return Err(SessionError::unsupported(&rt.name, "store cannot page results"));
        }
        let paths = includes
            .iter()
            .map(|path| include::resolve_path(&catalog, rt, path))
            .collect::<SessionResult<Vec<IncludePath>>>()?;
        if !paths.is_empty() && !capabilities.in_list {
            return Err(SessionError::unsupported(
                &rt.name,
                "store cannot batch key lookups for include",
            ));
        }

        let request = FetchRequest {
            filter,
            order,
            offset,
            limit,
        };
        tracing::debug!(
            record_type = %rt.name,
            filter = %request.filter.as_ref().map(ToString::to_string).unwrap_or_default(),
            includes = paths.len(),
            "query"
        );
        let rows = session.store().fetch_by_predicate(&rt.name, &request)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(session.materialize(&rt.name, row)?);
        }

        for path in &paths {
            include::load_path(session, &ids, path)?;
        }
        Ok(ids)
    }

    /// First result, if any.
    pub fn first(self) -> SessionResult<Option<InstanceId>> {
        Ok(self.limit(1).execute()?.into_iter().next())
    }
}

fn field_type(rt: &RecordType, field: &str) -> SessionResult<DataType> {
    rt.field(field).map(|f| f.data_type).ok_or_else(|| {
        SchemaError::FieldNotFound {
            record_type: rt.name.clone(),
            field: field.to_string(),
        }
        .into()
    })
}

/// Reject predicates the store can't evaluate natively.
fn check_predicate(
    rt: &RecordType,
    capabilities: &StoreCapabilities,
    predicate: &Predicate,
) -> SessionResult<()> {
    let unsupported = |reason: String| SessionError::unsupported(&rt.name, reason);
    match predicate {
        Predicate::Compare { field, op, .. } => {
            let data_type = field_type(rt, field)?;
            if *op != CompareOp::Eq && !capabilities.comparisons {
                return Err(unsupported(format!("comparison on '{}'", field)));
            }
            if op.is_ordering() && !data_type.is_orderable() {
                return Err(unsupported(format!(
                    "'{}' has type {} which has no ordering",
                    field, data_type
                )));
            }
        }
        Predicate::In { field, .. } => {
            field_type(rt, field)?;
            if !capabilities.in_list {
                return Err(unsupported(format!("IN list on '{}'", field)));
            }
        }
        Predicate::IsNull { field, .. } => {
            field_type(rt, field)?;
            if !capabilities.null_checks {
                return Err(unsupported(format!("null check on '{}'", field)));
            }
        }
        Predicate::Like { field, .. } => {
            let data_type = field_type(rt, field)?;
            if !capabilities.pattern_match {
                return Err(unsupported(format!("pattern match on '{}'", field)));
            }
            if !matches!(data_type, DataType::Text | DataType::Uuid) {
                return Err(unsupported(format!(
                    "LIKE on '{}' of type {}",
                    field, data_type
                )));
            }
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            if !capabilities.boolean_logic {
                return Err(unsupported("boolean combination of predicates".to_string()));
            }
            for part in parts {
                check_predicate(rt, capabilities, part)?;
            }
        }
        Predicate::Not(inner) => {
            if !capabilities.boolean_logic {
                return Err(unsupported("negated predicate".to_string()));
            }
            check_predicate(rt, capabilities, inner)?;
        }
    }
    Ok(())
}

fn check_order(
    rt: &RecordType,
    capabilities: &StoreCapabilities,
    order: &[OrderBy],
) -> SessionResult<()> {
    for key in order {
        let data_type = field_type(rt, &key.field)?;
        if !capabilities.ordering {
            return Err(SessionError::unsupported(&rt.name, "store cannot order results"));
        }
        if !data_type.is_orderable() {
            return Err(SessionError::unsupported(
                &rt.name,
                format!("cannot order by '{}' of type {}", key.field, data_type),
            ));
        }
    }
    Ok(())
}
