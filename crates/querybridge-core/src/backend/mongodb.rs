//! MongoDB query documents and aggregation pipelines.
//!
//! Queries are expressed in extended JSON; a driver-backed connector converts
//! them to BSON (`{"$date": …}` literals included) and hands cursor batches
//! back through [`page_from_batch`].

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use super::{Backend, BackendKind};
use crate::connector::{Continuation, Page};
use crate::error::EngineError;
use crate::filter::{Comparison, Literal, Predicate};
use crate::normalize::{format_datetime, NativeRow};
use crate::query::{
    alias, CompiledQuery, NativeQuery, OutputKeys, PageStrategy, Projection, QueryPlan, QueryShape,
};
use crate::type_mapping::TypeMapper;
use crate::types::{Aggregation, CanonicalType, ColumnInfo, DateLevel, RawColumn};

const TYPES: &[(&str, CanonicalType)] = &[
    ("number", CanonicalType::Numeric),
    ("double", CanonicalType::Numeric),
    ("int", CanonicalType::Numeric),
    ("int32", CanonicalType::Numeric),
    ("long", CanonicalType::Numeric),
    ("int64", CanonicalType::Numeric),
    ("decimal", CanonicalType::Numeric),
    ("decimal128", CanonicalType::Numeric),
    ("date", CanonicalType::Datetime),
    ("timestamp", CanonicalType::Datetime),
    ("string", CanonicalType::Hierarchy),
    ("objectid", CanonicalType::Hierarchy),
    ("boolean", CanonicalType::Hierarchy),
    ("bool", CanonicalType::Hierarchy),
    ("bindata", CanonicalType::Hierarchy),
    ("regex", CanonicalType::Hierarchy),
    ("object", CanonicalType::Hierarchy),
    ("null", CanonicalType::Hierarchy),
];

/// Documents per collection inspected when inferring a schema.
pub const SCHEMA_SAMPLE_SIZE: usize = 200;

pub struct MongoBackend {
    types: TypeMapper,
}

impl MongoBackend {
    pub fn new() -> Self {
        Self {
            types: TypeMapper::literal("mongodb", TYPES),
        }
    }
}

impl Default for MongoBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn literal_json(literal: &Literal) -> Value {
    match literal {
        Literal::Timestamp(ts) => json!({ "$date": format_datetime(ts) }),
        other => other.to_json(),
    }
}

fn field_condition(column: &ColumnInfo, condition: Value) -> Value {
    let mut doc = Map::new();
    doc.insert(column.native_name.clone(), condition);
    Value::Object(doc)
}

/// Render a predicate as a query document.
pub fn filter_document(predicate: &Predicate) -> Value {
    match predicate {
        Predicate::Compare { column, op, value } => {
            let operator = match op {
                Comparison::Eq => "$eq",
                Comparison::Ne => "$ne",
                Comparison::Lt => "$lt",
                Comparison::Le => "$lte",
                Comparison::Gt => "$gt",
                Comparison::Ge => "$gte",
            };
            field_condition(column, json!({ operator: literal_json(value) }))
        }
        Predicate::Between {
            column,
            low,
            high,
            negated: false,
        } => field_condition(
            column,
            json!({ "$gte": literal_json(low), "$lte": literal_json(high) }),
        ),
        Predicate::Between {
            column,
            low,
            high,
            negated: true,
        } => json!({ "$or": [
            field_condition(column, json!({ "$lt": literal_json(low) })),
            field_condition(column, json!({ "$gt": literal_json(high) })),
        ]}),
        Predicate::InList {
            column,
            values,
            negated,
        } => {
            let operator = if *negated { "$nin" } else { "$in" };
            let values: Vec<Value> = values.iter().map(literal_json).collect();
            field_condition(column, json!({ operator: values }))
        }
        // `{field: null}` matches both null and missing fields.
        Predicate::IsNull {
            column,
            negated: false,
        } => field_condition(column, Value::Null),
        Predicate::IsNull {
            column,
            negated: true,
        } => field_condition(column, json!({ "$ne": null })),
        Predicate::Any(parts) => json!({ "$or": parts.iter().map(filter_document).collect::<Vec<_>>() }),
        Predicate::All(parts) => json!({ "$and": parts.iter().map(filter_document).collect::<Vec<_>>() }),
        Predicate::Constant(true) => json!({}),
        Predicate::Constant(false) => json!({ "$expr": false }),
    }
}

fn match_document(predicates: &[Predicate]) -> Value {
    match predicates {
        [] => json!({}),
        [single] => filter_document(single),
        many => json!({ "$and": many.iter().map(filter_document).collect::<Vec<_>>() }),
    }
}

fn field_ref(column: &ColumnInfo) -> String {
    format!("${}", column.native_name)
}

fn group_key(column: &ColumnInfo, level: Option<DateLevel>) -> Value {
    match level {
        Some(DateLevel::Week) => json!({
            "$dateTrunc": { "date": field_ref(column), "unit": "week", "startOfWeek": "monday" }
        }),
        Some(level) => json!({
            "$dateTrunc": { "date": field_ref(column), "unit": level.as_str() }
        }),
        None => json!(field_ref(column)),
    }
}

fn accumulator(column: &ColumnInfo, aggregation: Aggregation) -> Value {
    let field = field_ref(column);
    match aggregation {
        Aggregation::Sum => json!({ "$sum": field }),
        Aggregation::Min => json!({ "$min": field }),
        Aggregation::Max => json!({ "$max": field }),
        Aggregation::Count => json!({
            "$sum": { "$cond": [{ "$ne": [{ "$ifNull": [field, null] }, null] }, 1, 0] }
        }),
        Aggregation::Distinctcount => json!({ "$addToSet": field }),
    }
}

impl Backend for MongoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongodb
    }

    fn type_mapper(&self) -> &TypeMapper {
        &self.types
    }

    fn compile_query(&self, plan: &QueryPlan) -> Result<CompiledQuery, EngineError> {
        let shape = plan.shape();
        let filter = match_document(&plan.predicates);
        let namespace = plan.dataset_name.clone();

        let (native, strategy, keys) = if shape == QueryShape::Rows {
            let mut projection = Map::new();
            for projection_item in &plan.projections {
                if let Projection::Column { column, .. } = projection_item {
                    projection.insert(column.native_name.clone(), json!(1));
                }
            }
            if !projection.contains_key("_id") {
                projection.insert("_id".into(), json!(0));
            }
            (
                NativeQuery::Find {
                    namespace,
                    filter,
                    projection: Value::Object(projection),
                    batch_size: None,
                },
                PageStrategy::Cursor,
                OutputKeys::NativeName,
            )
        } else {
            let mut id = Map::new();
            let mut group = Map::new();
            let mut distinct = Vec::new();
            for (i, projection) in plan.projections.iter().enumerate() {
                match projection {
                    Projection::Column { column, level } => {
                        id.insert(alias(i), group_key(column, *level));
                    }
                    Projection::Aggregate {
                        column,
                        aggregation,
                    } => {
                        if *aggregation == Aggregation::Distinctcount {
                            distinct.push(alias(i));
                        }
                        group.insert(alias(i), accumulator(column, *aggregation));
                    }
                    Projection::RowCount => {
                        group.insert(alias(i), json!({ "$sum": 1 }));
                    }
                    Projection::Unit => {}
                }
            }
            group.insert(
                "_id".into(),
                if id.is_empty() {
                    Value::Null
                } else {
                    Value::Object(id)
                },
            );

            let mut pipeline = Vec::new();
            if filter.as_object().map_or(true, |f| !f.is_empty()) {
                pipeline.push(json!({ "$match": filter }));
            }
            let outputs: Vec<String> = group.keys().filter(|k| *k != "_id").cloned().collect();
            pipeline.push(json!({ "$group": group }));
            if !distinct.is_empty() {
                let mut project = Map::new();
                project.insert("_id".into(), json!(1));
                for key in outputs {
                    let value = if distinct.contains(&key) {
                        json!({ "$size": format!("${key}") })
                    } else {
                        json!(1)
                    };
                    project.insert(key, value);
                }
                pipeline.push(json!({ "$project": project }));
            }
            let strategy = if shape == QueryShape::Aggregate {
                PageStrategy::SingleShot
            } else {
                PageStrategy::Cursor
            };
            (
                NativeQuery::Aggregate {
                    namespace,
                    pipeline,
                    batch_size: None,
                },
                strategy,
                OutputKeys::Alias,
            )
        };

        let compiled = CompiledQuery {
            backend: BackendKind::Mongodb,
            native,
            group_count: plan.group_count(),
            shape,
            strategy,
            outputs: plan.outputs(keys),
        };
        tracing::debug!(backend = "mongodb", query = %compiled.native, "compiled query");
        Ok(compiled)
    }

    fn page_query(
        &self,
        compiled: &CompiledQuery,
        _continuation: Option<&Continuation>,
        batch_size: usize,
    ) -> NativeQuery {
        match &compiled.native {
            NativeQuery::Find {
                namespace,
                filter,
                projection,
                ..
            } => NativeQuery::Find {
                namespace: namespace.clone(),
                filter: filter.clone(),
                projection: projection.clone(),
                batch_size: Some(batch_size),
            },
            NativeQuery::Aggregate {
                namespace,
                pipeline,
                ..
            } => NativeQuery::Aggregate {
                namespace: namespace.clone(),
                pipeline: pipeline.clone(),
                batch_size: Some(batch_size),
            },
            other => other.clone(),
        }
    }
}

/// Flatten nested documents into dotted keys; arrays collapse to their first element.
pub fn flatten_document(doc: &Map<String, Value>) -> Map<String, Value> {
    fn is_leaf_object(obj: &Map<String, Value>) -> bool {
        obj.keys().any(|k| k.starts_with('$'))
    }

    fn walk(key: String, mut value: &Value, out: &mut Map<String, Value>) {
        while let Value::Array(items) = value {
            match items.first() {
                Some(first) => value = first,
                None => {
                    out.insert(key, Value::Null);
                    return;
                }
            }
        }
        match value {
            Value::Object(obj) if !is_leaf_object(obj) => {
                for (sub, child) in obj {
                    walk(format!("{key}.{sub}"), child, out);
                }
            }
            other => {
                out.insert(key, other.clone());
            }
        }
    }

    let mut out = Map::new();
    for (key, value) in doc {
        walk(key.clone(), value, &mut out);
    }
    out
}

/// BSON type name of a flattened extended-JSON value.
fn bson_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Array(_) => "object",
        Value::Object(obj) => {
            let Some(key) = obj.keys().find(|k| k.starts_with('$')) else {
                return "object";
            };
            match key.as_str() {
                "$date" => "date",
                "$timestamp" => "timestamp",
                "$oid" => "objectId",
                "$numberInt" => "int",
                "$numberLong" => "long",
                "$numberDouble" => "double",
                "$numberDecimal" => "decimal",
                "$binary" => "binData",
                "$regularExpression" => "regex",
                _ => "object",
            }
        }
    }
}

/// Infer the columns of a collection from sampled documents.
///
/// Nested documents become dotted columns and arrays contribute the fields
/// of their first element, the same way rows are flattened. A field keeps
/// the first non-null type seen; fields that are always null stay `null`.
/// At most [`SCHEMA_SAMPLE_SIZE`] documents are read.
pub fn columns_from_sample(namespace: &str, documents: &[Value]) -> Vec<RawColumn> {
    let mut order = Vec::new();
    let mut types: HashMap<String, &'static str> = HashMap::new();
    for doc in documents.iter().take(SCHEMA_SAMPLE_SIZE) {
        let Value::Object(doc) = doc else {
            continue;
        };
        for (path, value) in flatten_document(doc) {
            let detected = bson_type(&value);
            match types.get(&path).copied() {
                None => {
                    order.push(path.clone());
                    types.insert(path, detected);
                }
                Some("null") if detected != "null" => {
                    types.insert(path, detected);
                }
                Some(_) => {}
            }
        }
    }
    order
        .into_iter()
        .map(|path| {
            let native = types.get(&path).copied().unwrap_or("null");
            RawColumn::new(namespace, path, native)
        })
        .collect()
}

/// Page from one cursor batch. A cursor id of 0 means the cursor is exhausted.
pub fn page_from_batch(shape: QueryShape, documents: Vec<Value>, cursor_id: i64) -> Page {
    let rows = documents
        .into_iter()
        .filter_map(|doc| match doc {
            Value::Object(doc) => Some(doc),
            _ => None,
        })
        .map(|mut doc| match shape {
            QueryShape::Rows => NativeRow::Document(flatten_document(&doc)),
            QueryShape::Grouped | QueryShape::Aggregate => {
                let keys = match doc.remove("_id") {
                    Some(Value::Object(keys)) => keys,
                    _ => Map::new(),
                };
                NativeRow::Bucket {
                    keys,
                    values: doc,
                    doc_count: None,
                }
            }
        })
        .collect();
    let continuation = (cursor_id != 0).then(|| Continuation::Cursor(cursor_id.to_string()));
    Page::new(rows, continuation)
}
