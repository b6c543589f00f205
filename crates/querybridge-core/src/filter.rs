//! Backend-neutral predicate compilation.
//!
//! Request filters are resolved against the schema and lowered into a small
//! predicate tree. Each backend renders that tree in its own syntax; the null
//! handling of `in` / `not in` is settled here once for all of them.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::EngineError;
use crate::normalize::parse_datetime;
use crate::types::{CanonicalType, ColumnInfo, Dataset, Filter, FilterExpression};

/// Half width of the range used for approximate numeric equality.
pub const EQUALITY_EPSILON: f64 = 0.5e-16;

/// A filter value coerced to the column's canonical type.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Literal {
    /// JSON rendering shared by the document backends. Timestamps become epoch millis.
    pub fn to_json(&self) -> Value {
        match self {
            Literal::Number(n) => number_json(*n),
            Literal::Text(s) => Value::String(s.clone()),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Timestamp(ts) => Value::from(ts.timestamp_millis()),
        }
    }
}

/// Integral values render without a fractional part.
pub fn number_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn sql_operator(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

/// Resolved predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: ColumnInfo,
        op: Comparison,
        value: Literal,
    },
    /// Closed range `[low, high]`; negated means outside of it.
    Between {
        column: ColumnInfo,
        low: Literal,
        high: Literal,
        negated: bool,
    },
    InList {
        column: ColumnInfo,
        values: Vec<Literal>,
        negated: bool,
    },
    IsNull {
        column: ColumnInfo,
        negated: bool,
    },
    Any(Vec<Predicate>),
    All(Vec<Predicate>),
    Constant(bool),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Compile numeric `=` / `<>` (and `in` / `not in`) as ε ranges.
    pub approximate_equality: bool,
}

/// Compile every filter; the result is an implicit conjunction.
pub fn compile_filters(
    filters: &[Filter],
    dataset: &Dataset,
    options: FilterOptions,
) -> Result<Vec<Predicate>, EngineError> {
    filters
        .iter()
        .map(|filter| {
            let column = dataset.resolve(&filter.column_id)?;
            compile_filter(filter, column, options)
        })
        .collect()
}

pub fn compile_filter(
    filter: &Filter,
    column: &ColumnInfo,
    options: FilterOptions,
) -> Result<Predicate, EngineError> {
    use FilterExpression::*;
    let op = match filter.expression {
        IsNull => return Ok(is_null(column, false)),
        IsNotNull => return Ok(is_null(column, true)),
        In => return membership(filter, column, false, options),
        NotIn => return membership(filter, column, true, options),
        Eq => Comparison::Eq,
        Ne => Comparison::Ne,
        Lt => Comparison::Lt,
        Le => Comparison::Le,
        Gt => Comparison::Gt,
        Ge => Comparison::Ge,
    };

    let raw = filter.value.first().ok_or_else(|| {
        EngineError::BadRequest(format!(
            "filter '{}' on {} requires a value",
            filter.expression, filter.column_id
        ))
    })?;
    if raw.is_null() {
        return match op {
            Comparison::Eq => Ok(is_null(column, false)),
            Comparison::Ne => Ok(is_null(column, true)),
            _ => Err(EngineError::BadRequest(format!(
                "cannot compare {} with null using '{}'",
                filter.column_id, filter.expression
            ))),
        };
    }
    let value = coerce(raw, column)?;

    if let (true, Literal::Number(n), Comparison::Eq | Comparison::Ne) =
        (approximates(column, options), &value, op)
    {
        return Ok(epsilon_range(column, *n, op == Comparison::Ne));
    }
    Ok(Predicate::Compare {
        column: column.clone(),
        op,
        value,
    })
}

fn approximates(column: &ColumnInfo, options: FilterOptions) -> bool {
    options.approximate_equality && column.canonical_type == CanonicalType::Numeric
}

fn is_null(column: &ColumnInfo, negated: bool) -> Predicate {
    Predicate::IsNull {
        column: column.clone(),
        negated,
    }
}

fn epsilon_range(column: &ColumnInfo, n: f64, negated: bool) -> Predicate {
    Predicate::Between {
        column: column.clone(),
        low: Literal::Number(n - EQUALITY_EPSILON),
        high: Literal::Number(n + EQUALITY_EPSILON),
        negated,
    }
}

/// `in` / `not in` with the null marker:
///
/// | expression | null in list | compiled                                 |
/// |------------|--------------|------------------------------------------|
/// | in         | yes          | `col IN (…) OR col IS NULL`              |
/// | in         | no           | `col IN (…)`                             |
/// | not in     | yes          | `col NOT IN (…) OR col IS NULL`          |
/// | not in     | no           | `col NOT IN (…) AND col IS NOT NULL`     |
fn membership(
    filter: &Filter,
    column: &ColumnInfo,
    negated: bool,
    options: FilterOptions,
) -> Result<Predicate, EngineError> {
    let with_null = filter.value.iter().any(Value::is_null);
    let values = filter
        .value
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| coerce(v, column))
        .collect::<Result<Vec<_>, _>>()?;
    let list = (!values.is_empty()).then(|| list_predicate(column, values, negated, options));

    Ok(match (negated, with_null, list) {
        (_, true, Some(list)) => Predicate::Any(vec![list, is_null(column, false)]),
        (false, true, None) => is_null(column, false),
        (false, false, Some(list)) => list,
        (false, false, None) => Predicate::Constant(false),
        (true, true, None) => Predicate::Constant(true),
        (true, false, Some(list)) => Predicate::All(vec![list, is_null(column, true)]),
        (true, false, None) => is_null(column, true),
    })
}

fn list_predicate(
    column: &ColumnInfo,
    values: Vec<Literal>,
    negated: bool,
    options: FilterOptions,
) -> Predicate {
    if approximates(column, options) {
        let ranges = values
            .iter()
            .filter_map(|v| match v {
                Literal::Number(n) => Some(epsilon_range(column, *n, negated)),
                _ => None,
            })
            .collect();
        return if negated {
            Predicate::All(ranges)
        } else {
            Predicate::Any(ranges)
        };
    }
    Predicate::InList {
        column: column.clone(),
        values,
        negated,
    }
}

/// Coerce one non-null filter value to the column's canonical type.
pub fn coerce(value: &Value, column: &ColumnInfo) -> Result<Literal, EngineError> {
    let mismatch = || {
        EngineError::BadRequest(format!(
            "value {value} is not valid for {} column {}",
            column.canonical_type, column.column_id
        ))
    };
    match column.canonical_type {
        CanonicalType::Numeric => {
            let n = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|n| n.is_finite())
            .ok_or_else(mismatch)?;
            Ok(Literal::Number(n))
        }
        CanonicalType::Datetime => {
            let ts = match value {
                Value::String(s) => parse_datetime(s),
                Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
                _ => None,
            }
            .ok_or_else(mismatch)?;
            Ok(Literal::Timestamp(ts))
        }
        CanonicalType::Hierarchy => match value {
            Value::String(s) => Ok(Literal::Text(s.clone())),
            Value::Number(n) => Ok(Literal::Text(n.to_string())),
            Value::Bool(b) => Ok(Literal::Bool(*b)),
            _ => Err(mismatch()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(id: &str, ty: CanonicalType) -> ColumnInfo {
        ColumnInfo {
            column_id: id.into(),
            native_name: id.into(),
            canonical_type: ty,
            native_type: String::new(),
            dataset_id: "orders".into(),
            has_keyword: false,
        }
    }

    fn filter(expr: FilterExpression, value: Vec<Value>) -> Filter {
        Filter::new("status", expr, value)
    }

    fn status() -> ColumnInfo {
        column("status", CanonicalType::Hierarchy)
    }

    fn text(s: &str) -> Literal {
        Literal::Text(s.into())
    }

    #[test]
    fn in_with_null_adds_null_branch() {
        let p = compile_filter(
            &filter(FilterExpression::In, vec![json!("A"), json!("B"), Value::Null]),
            &status(),
            FilterOptions::default(),
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::Any(vec![
                Predicate::InList {
                    column: status(),
                    values: vec![text("A"), text("B")],
                    negated: false
                },
                Predicate::IsNull {
                    column: status(),
                    negated: false
                },
            ])
        );
    }

    #[test]
    fn in_without_null_is_plain_membership() {
        let p = compile_filter(
            &filter(FilterExpression::In, vec![json!("A")]),
            &status(),
            FilterOptions::default(),
        )
        .unwrap();
        assert!(matches!(p, Predicate::InList { negated: false, .. }));
    }

    #[test]
    fn not_in_with_null_keeps_nulls() {
        let p = compile_filter(
            &filter(FilterExpression::NotIn, vec![json!("A"), Value::Null]),
            &status(),
            FilterOptions::default(),
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::Any(vec![
                Predicate::InList {
                    column: status(),
                    values: vec![text("A")],
                    negated: true
                },
                Predicate::IsNull {
                    column: status(),
                    negated: false
                },
            ])
        );
    }

    #[test]
    fn not_in_without_null_excludes_nulls() {
        let p = compile_filter(
            &filter(FilterExpression::NotIn, vec![json!("A"), json!("B")]),
            &status(),
            FilterOptions::default(),
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::All(vec![
                Predicate::InList {
                    column: status(),
                    values: vec![text("A"), text("B")],
                    negated: true
                },
                Predicate::IsNull {
                    column: status(),
                    negated: true
                },
            ])
        );
    }

    #[test]
    fn degenerate_lists() {
        let opts = FilterOptions::default();
        let only_null = vec![Value::Null];
        assert_eq!(
            compile_filter(&filter(FilterExpression::In, only_null.clone()), &status(), opts).unwrap(),
            Predicate::IsNull { column: status(), negated: false }
        );
        assert_eq!(
            compile_filter(&filter(FilterExpression::NotIn, only_null), &status(), opts).unwrap(),
            Predicate::Constant(true)
        );
        assert_eq!(
            compile_filter(&filter(FilterExpression::In, vec![]), &status(), opts).unwrap(),
            Predicate::Constant(false)
        );
        assert_eq!(
            compile_filter(&filter(FilterExpression::NotIn, vec![]), &status(), opts).unwrap(),
            Predicate::IsNull { column: status(), negated: true }
        );
    }

    #[test]
    fn numeric_equality_becomes_epsilon_range_when_requested() {
        let amount = column("amount", CanonicalType::Numeric);
        let f = Filter::new("amount", FilterExpression::Ne, vec![json!(0.1)]);
        let approximate = FilterOptions {
            approximate_equality: true,
        };
        match compile_filter(&f, &amount, approximate).unwrap() {
            Predicate::Between {
                low: Literal::Number(low),
                high: Literal::Number(high),
                negated,
                ..
            } => {
                assert!(negated);
                assert_eq!(low, 0.1 - EQUALITY_EPSILON);
                assert_eq!(high, 0.1 + EQUALITY_EPSILON);
            }
            other => panic!("unexpected predicate {other:?}"),
        }
        assert!(matches!(
            compile_filter(&f, &amount, FilterOptions::default()).unwrap(),
            Predicate::Compare { op: Comparison::Ne, .. }
        ));
    }

    #[test]
    fn hierarchy_inequality_stays_a_direct_comparison() {
        let approximate = FilterOptions {
            approximate_equality: true,
        };
        let p = compile_filter(
            &filter(FilterExpression::Ne, vec![json!("closed")]),
            &status(),
            approximate,
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::Compare {
                column: status(),
                op: Comparison::Ne,
                value: text("closed")
            }
        );
    }

    #[test]
    fn null_comparisons() {
        let opts = FilterOptions::default();
        assert_eq!(
            compile_filter(&filter(FilterExpression::Eq, vec![Value::Null]), &status(), opts).unwrap(),
            Predicate::IsNull { column: status(), negated: false }
        );
        assert!(matches!(
            compile_filter(&filter(FilterExpression::Lt, vec![Value::Null]), &status(), opts),
            Err(EngineError::BadRequest(_))
        ));
        assert!(matches!(
            compile_filter(&filter(FilterExpression::Eq, vec![]), &status(), opts),
            Err(EngineError::BadRequest(_))
        ));
    }

    #[test]
    fn datetime_values_are_parsed() {
        let created = column("created_at", CanonicalType::Datetime);
        let f = Filter::new("created_at", FilterExpression::Ge, vec![json!("2024-03-01T10:00:00Z")]);
        match compile_filter(&f, &created, FilterOptions::default()).unwrap() {
            Predicate::Compare {
                value: Literal::Timestamp(ts),
                ..
            } => assert_eq!(ts.timestamp_millis(), 1_709_287_200_000),
            other => panic!("unexpected predicate {other:?}"),
        }
        let bad = Filter::new("created_at", FilterExpression::Ge, vec![json!("yesterday")]);
        assert!(compile_filter(&bad, &created, FilterOptions::default()).is_err());
    }

    #[test]
    fn unknown_columns_are_not_found() {
        let dataset = Dataset::new("orders");
        let err = compile_filters(
            &[filter(FilterExpression::IsNull, vec![])],
            &dataset,
            FilterOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DatasetOrColumnNotFound(_)));
    }
}
