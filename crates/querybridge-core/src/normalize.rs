//! Native rows to [`ResultRow`]s.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::query::{OutputColumn, OutputRole};
use crate::types::{CanonicalType, ResultRow};

/// A row as a connector hands it over.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRow {
    /// Values in projection order (SQL result sets).
    Positional(Vec<Value>),
    /// A document addressed by (possibly dotted) field names.
    Document(Map<String, Value>),
    /// One aggregation bucket: key values, metric values and its row count.
    Bucket {
        keys: Map<String, Value>,
        values: Map<String, Value>,
        doc_count: Option<u64>,
    },
}

/// Select and coerce the values of `row` into request order.
///
/// Missing fields become `null`.
pub fn normalize(row: NativeRow, outputs: &[OutputColumn]) -> ResultRow {
    outputs
        .iter()
        .enumerate()
        .map(|(position, output)| {
            let raw = match output.role {
                OutputRole::Unit => return Value::from(1),
                OutputRole::RowCount => row_count(&row, position, output),
                OutputRole::Value | OutputRole::Count => extract(&row, position, output),
            };
            coerce(raw, output.canonical)
        })
        .collect()
}

/// The row a single-row aggregate stands for when the backend emitted none:
/// counts are zero, every other aggregate is `null`.
pub fn empty_aggregate(outputs: &[OutputColumn]) -> NativeRow {
    NativeRow::Positional(
        outputs
            .iter()
            .map(|output| match output.role {
                OutputRole::Count | OutputRole::RowCount => Value::from(0),
                OutputRole::Unit => Value::from(1),
                OutputRole::Value => Value::Null,
            })
            .collect(),
    )
}

fn row_count(row: &NativeRow, position: usize, output: &OutputColumn) -> Value {
    match row {
        NativeRow::Bucket {
            doc_count: Some(count),
            ..
        } => Value::from(*count),
        _ => extract(row, position, output),
    }
}

fn extract(row: &NativeRow, position: usize, output: &OutputColumn) -> Value {
    match row {
        NativeRow::Positional(values) => values.get(position).cloned().unwrap_or(Value::Null),
        NativeRow::Document(doc) => lookup_path(doc, &output.key, output.canonical),
        NativeRow::Bucket { keys, values, .. } => keys
            .get(&output.key)
            .or_else(|| values.get(&output.key))
            .map(metric_value)
            .unwrap_or(Value::Null),
    }
}

/// Metric aggregations answer `{"value": …}`; other objects (extended JSON
/// dates) pass through.
fn metric_value(value: &Value) -> Value {
    match value.as_object().and_then(|obj| obj.get("value")) {
        Some(inner) => inner.clone(),
        None => value.clone(),
    }
}

/// Resolve `path` in a document.
///
/// An exact key wins (flattened `fields` responses), otherwise the dotted
/// path is walked through nested objects. Arrays of objects are mapped
/// element-wise; a single-element array unwraps to its element.
pub fn lookup_path(doc: &Map<String, Value>, path: &str, canonical: CanonicalType) -> Value {
    if let Some(value) = doc.get(path) {
        return unwrap_array(value.clone(), canonical);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let found = match segments.split_first() {
        Some((head, rest)) => doc
            .get(*head)
            .map(|child| walk(child, rest))
            .unwrap_or(Value::Null),
        None => Value::Null,
    };
    unwrap_array(found, canonical)
}

fn walk(value: &Value, segments: &[&str]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(obj) => obj
            .get(*head)
            .map(|child| walk(child, rest))
            .unwrap_or(Value::Null),
        Value::Array(items) => {
            let mapped: Vec<Value> = items
                .iter()
                .map(|item| walk(item, segments))
                .filter(|v| !v.is_null())
                .collect();
            if mapped.is_empty() {
                Value::Null
            } else {
                Value::Array(mapped)
            }
        }
        _ => Value::Null,
    }
}

fn unwrap_array(value: Value, canonical: CanonicalType) -> Value {
    match value {
        Value::Array(mut items) => match items.len() {
            0 => Value::Null,
            1 => items.remove(0),
            // Several values only make sense as a label.
            _ if canonical == CanonicalType::Hierarchy => Value::Array(items),
            _ => Value::Null,
        },
        other => other,
    }
}

fn coerce(value: Value, canonical: CanonicalType) -> Value {
    match canonical {
        CanonicalType::Datetime => normalize_datetime(&value),
        CanonicalType::Numeric => match value {
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(crate::filter::number_json)
                .unwrap_or(value),
            other => other,
        },
        CanonicalType::Hierarchy => value,
    }
}

/// Canonical rendering of any native datetime representation:
/// ISO-8601, UTC, millisecond precision.
pub fn normalize_datetime(value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match datetime_of(value) {
        Some(ts) => Value::String(format_datetime(&ts)),
        None => {
            tracing::warn!(value = %value, "unparseable datetime, returning null");
            Value::Null
        }
    }
}

fn datetime_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(millis) => DateTime::from_timestamp_millis(millis),
            Err(_) => parse_datetime(s),
        },
        // Extended JSON: {"$date": …}, {"$numberLong": "…"} and {"$timestamp": {"t": secs}}
        Value::Object(obj) => match obj.get("$timestamp") {
            Some(ts) => ts
                .get("t")
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            None => obj
                .get("$date")
                .or_else(|| obj.get("$numberLong"))
                .and_then(datetime_of),
        },
        _ => None,
    }
}

pub fn format_datetime(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse the textual timestamp forms backends and clients send.
/// Values without an offset are taken as UTC.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
