//! Filter predicates over record fields.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{compare_values, field_value, values_equal, Record};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// Whether the operator needs an ordering rather than equality.
    pub fn is_ordering(&self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::NotEq)
    }

    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

/// A filter over the fields of one record type.
///
/// Comparisons against null never match; use [`Predicate::is_null`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    IsNull {
        field: String,
        negated: bool,
    },
    /// SQL-style pattern: `%` matches any run, `_` a single character.
    /// Matching is case-insensitive.
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn not_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::NotEq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn lt_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::LtEq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn gt_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::GtEq, value)
    }

    pub fn in_list<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull {
            field: field.into(),
            negated: false,
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Predicate::IsNull {
            field: field.into(),
            negated: true,
        }
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Predicate::Like {
            field: field.into(),
            pattern: pattern.into(),
            negated: false,
        }
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (p, Predicate::And(mut b)) => {
                b.insert(0, p);
                Predicate::And(b)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Or(mut a), Predicate::Or(b)) => {
                a.extend(b);
                Predicate::Or(a)
            }
            (Predicate::Or(mut a), p) => {
                a.push(p);
                Predicate::Or(a)
            }
            (p, Predicate::Or(mut b)) => {
                b.insert(0, p);
                Predicate::Or(b)
            }
            (a, b) => Predicate::Or(vec![a, b]),
        }
    }

    /// Every field name the predicate reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { field, .. }
            | Predicate::In { field, .. }
            | Predicate::IsNull { field, .. }
            | Predicate::Like { field, .. } => out.push(field),
            Predicate::And(ps) | Predicate::Or(ps) => {
                ps.iter().for_each(|p| p.collect_fields(out));
            }
            Predicate::Not(p) => p.collect_fields(out),
        }
    }

    /// Evaluate against a record. Absent fields read as null.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Compare { field, op, value } => {
                compare(field_value(record, field), *op, value)
            }
            Predicate::In { field, values } => {
                let v = field_value(record, field);
                !v.is_null() && values.iter().any(|item| values_equal(v, item))
            }
            Predicate::IsNull { field, negated } => {
                field_value(record, field).is_null() != *negated
            }
            Predicate::Like {
                field,
                pattern,
                negated,
            } => match field_value(record, field) {
                Value::String(s) => like_match(s, pattern) != *negated,
                _ => false,
            },
            Predicate::And(ps) => ps.iter().all(|p| p.matches(record)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(record)),
            Predicate::Not(p) => !p.matches(record),
        }
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        _ => {
            let comparable = matches!(
                (left, right),
                (Value::Number(_), Value::Number(_))
                    | (Value::String(_), Value::String(_))
                    | (Value::Bool(_), Value::Bool(_))
            );
            if !comparable {
                return false;
            }
            let ord = compare_values(left, right);
            match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::LtEq => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }
    }
}

fn like_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    match_like(&s, &p, 0, 0)
}

fn match_like(s: &[char], p: &[char], si: usize, pi: usize) -> bool {
    if pi >= p.len() {
        return si >= s.len();
    }

    match p[pi] {
        '%' => (si..=s.len()).any(|i| match_like(s, p, i, pi + 1)),
        '_' => si < s.len() && match_like(s, p, si + 1, pi + 1),
        c => {
            si < s.len()
                && s[si].to_lowercase().eq(c.to_lowercase())
                && match_like(s, p, si + 1, pi + 1)
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, ps: &[Predicate], sep: &str| {
            write!(f, "(")?;
            for (i, p) in ps.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", p)?;
            }
            write!(f, ")")
        };

        match self {
            Predicate::Compare { field, op, value } => {
                write!(f, "{} {} {}", field, op.symbol(), value)
            }
            Predicate::In { field, values } => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN ({})", field, items.join(", "))
            }
            Predicate::IsNull { field, negated } => {
                write!(f, "{} IS {}NULL", field, if *negated { "NOT " } else { "" })
            }
            Predicate::Like {
                field,
                pattern,
                negated,
            } => write!(
                f,
                "{} {}LIKE '{}'",
                field,
                if *negated { "NOT " } else { "" },
                pattern
            ),
            Predicate::And(ps) => join(f, ps, "AND"),
            Predicate::Or(ps) => join(f, ps, "OR"),
            Predicate::Not(p) => write!(f, "NOT {}", p),
        }
    }
}
