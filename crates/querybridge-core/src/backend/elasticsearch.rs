//! Elasticsearch query DSL generation and response decoding.

use serde_json::{json, Map, Value};

use super::{Backend, BackendKind};
use crate::connector::{Continuation, Page};
use crate::error::EngineError;
use crate::filter::{FilterOptions, Literal, Predicate};
use crate::normalize::NativeRow;
use crate::query::{
    alias, CompiledQuery, NativeQuery, OutputKeys, PageStrategy, Projection, QueryPlan, QueryShape,
    SearchMode,
};
use crate::type_mapping::TypeMapper;
use crate::types::{Aggregation, CanonicalType, ColumnInfo, DateLevel, RawColumn};

/// Name of the composite aggregation carrying group buckets.
pub const GROUPS_AGG: &str = "groups";

const TYPES: &[(&str, CanonicalType)] = &[
    ("text", CanonicalType::Hierarchy),
    ("keyword", CanonicalType::Hierarchy),
    ("constant_keyword", CanonicalType::Hierarchy),
    ("wildcard", CanonicalType::Hierarchy),
    ("boolean", CanonicalType::Hierarchy),
    ("ip", CanonicalType::Hierarchy),
    ("object", CanonicalType::Hierarchy),
    ("nested", CanonicalType::Hierarchy),
    ("binary", CanonicalType::Hierarchy),
    ("byte", CanonicalType::Numeric),
    ("short", CanonicalType::Numeric),
    ("integer", CanonicalType::Numeric),
    ("long", CanonicalType::Numeric),
    ("unsigned_long", CanonicalType::Numeric),
    ("double", CanonicalType::Numeric),
    ("float", CanonicalType::Numeric),
    ("half_float", CanonicalType::Numeric),
    ("scaled_float", CanonicalType::Numeric),
    ("date", CanonicalType::Datetime),
    ("date_nanos", CanonicalType::Datetime),
];

/// Field types that cannot be expressed as a column.
const EXCLUDED_TYPES: &[&str] = &["geo_point", "geo_shape"];

pub struct ElasticsearchBackend {
    types: TypeMapper,
}

impl ElasticsearchBackend {
    pub fn new() -> Self {
        Self {
            types: TypeMapper::literal("elasticsearch", TYPES),
        }
    }
}

impl Default for ElasticsearchBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Field to use for exact-match terms, cardinality and value counts.
fn exact_field(column: &ColumnInfo) -> String {
    if column.has_keyword {
        format!("{}.keyword", column.native_name)
    } else {
        column.native_name.clone()
    }
}

fn literal_json(literal: &Literal) -> Value {
    literal.to_json()
}

fn range(column: &ColumnInfo, bounds: Map<String, Value>) -> Value {
    let mut bounds = bounds;
    if column.canonical_type == CanonicalType::Datetime {
        bounds.insert("format".into(), json!("epoch_millis"));
    }
    json!({ "range": { column.native_name.clone(): bounds } })
}

fn not(clause: Value) -> Value {
    json!({ "bool": { "must_not": [clause] } })
}

fn bound(op: &str, value: &Literal) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(op.to_string(), literal_json(value));
    map
}

/// Render a predicate as a query clause.
pub fn clause(predicate: &Predicate) -> Value {
    use crate::filter::Comparison::*;
    match predicate {
        Predicate::Compare { column, op, value } => {
            let equality = || match column.canonical_type {
                CanonicalType::Hierarchy => {
                    json!({ "term": { exact_field(column): literal_json(value) } })
                }
                CanonicalType::Datetime => {
                    let mut bounds = bound("gte", value);
                    bounds.extend(bound("lte", value));
                    range(column, bounds)
                }
                CanonicalType::Numeric => {
                    json!({ "term": { column.native_name.clone(): literal_json(value) } })
                }
            };
            match op {
                Eq => equality(),
                Ne => not(equality()),
                Lt => range(column, bound("lt", value)),
                Le => range(column, bound("lte", value)),
                Gt => range(column, bound("gt", value)),
                Ge => range(column, bound("gte", value)),
            }
        }
        Predicate::Between {
            column,
            low,
            high,
            negated,
        } => {
            let mut bounds = bound("gte", low);
            bounds.extend(bound("lte", high));
            let inside = range(column, bounds);
            if *negated {
                not(inside)
            } else {
                inside
            }
        }
        Predicate::InList {
            column,
            values,
            negated,
        } => {
            let inside = match column.canonical_type {
                CanonicalType::Datetime => json!({
                    "bool": {
                        "should": values.iter().map(|v| {
                            let mut bounds = bound("gte", v);
                            bounds.extend(bound("lte", v));
                            range(column, bounds)
                        }).collect::<Vec<_>>(),
                        "minimum_should_match": 1
                    }
                }),
                _ => json!({
                    "terms": { exact_field(column): values.iter().map(literal_json).collect::<Vec<_>>() }
                }),
            };
            if *negated {
                not(inside)
            } else {
                inside
            }
        }
        Predicate::IsNull { column, negated } => {
            let exists = json!({ "exists": { "field": column.native_name } });
            if *negated {
                exists
            } else {
                not(exists)
            }
        }
        Predicate::Any(parts) => json!({
            "bool": {
                "should": parts.iter().map(clause).collect::<Vec<_>>(),
                "minimum_should_match": 1
            }
        }),
        Predicate::All(parts) => json!({
            "bool": { "filter": parts.iter().map(clause).collect::<Vec<_>>() }
        }),
        Predicate::Constant(true) => json!({ "match_all": {} }),
        Predicate::Constant(false) => json!({ "match_none": {} }),
    }
}

fn query_clause(predicates: &[Predicate]) -> Value {
    if predicates.is_empty() {
        return json!({ "match_all": {} });
    }
    json!({ "bool": { "filter": predicates.iter().map(clause).collect::<Vec<_>>() } })
}

fn group_source(column: &ColumnInfo, level: Option<DateLevel>) -> Value {
    match level {
        Some(level) => {
            let (key, interval) = match level {
                DateLevel::Millisecond => ("fixed_interval", "1ms"),
                DateLevel::Second => ("fixed_interval", "1s"),
                other => ("calendar_interval", other.as_str()),
            };
            json!({
                "date_histogram": {
                    "field": column.native_name,
                    key: interval,
                    "missing_bucket": true
                }
            })
        }
        None => json!({
            "terms": { "field": exact_field(column), "missing_bucket": true }
        }),
    }
}

fn metric(column: &ColumnInfo, aggregation: Aggregation) -> Value {
    match aggregation {
        Aggregation::Sum => json!({ "sum": { "field": column.native_name } }),
        Aggregation::Min => json!({ "min": { "field": column.native_name } }),
        Aggregation::Max => json!({ "max": { "field": column.native_name } }),
        Aggregation::Count => json!({ "value_count": { "field": exact_field(column) } }),
        Aggregation::Distinctcount => json!({ "cardinality": { "field": exact_field(column) } }),
    }
}

impl Backend for ElasticsearchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Elasticsearch
    }

    fn type_mapper(&self) -> &TypeMapper {
        &self.types
    }

    fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            approximate_equality: true,
        }
    }

    fn compile_query(&self, plan: &QueryPlan) -> Result<CompiledQuery, EngineError> {
        let shape = plan.shape();
        let query = query_clause(&plan.predicates);

        let mut sources = Vec::new();
        let mut metrics = Map::new();
        let mut source_fields = Vec::new();
        let mut docvalue_fields = Vec::new();
        for (i, projection) in plan.projections.iter().enumerate() {
            match projection {
                Projection::Column { column, level } if plan.pushdown => {
                    let mut source = Map::new();
                    source.insert(alias(i), group_source(column, *level));
                    sources.push(Value::Object(source));
                }
                Projection::Column { column, .. } => {
                    if column.canonical_type == CanonicalType::Datetime {
                        docvalue_fields.push(json!({
                            "field": column.native_name,
                            "format": "epoch_millis"
                        }));
                    } else {
                        source_fields.push(Value::String(column.native_name.clone()));
                    }
                }
                Projection::Aggregate {
                    column,
                    aggregation,
                } => {
                    metrics.insert(alias(i), metric(column, *aggregation));
                }
                Projection::RowCount | Projection::Unit => {}
            }
        }

        let (body, mode, strategy, keys) = match shape {
            QueryShape::Rows => (
                json!({
                    "query": query,
                    "_source": source_fields,
                    "docvalue_fields": docvalue_fields,
                    "sort": ["_doc"]
                }),
                SearchMode::Hits { scroll: true },
                PageStrategy::Cursor,
                OutputKeys::NativeName,
            ),
            QueryShape::Grouped => {
                let mut groups = json!({ "composite": { "sources": sources } });
                if !metrics.is_empty() {
                    groups["aggs"] = Value::Object(metrics);
                }
                (
                    json!({
                        "size": 0,
                        "query": query,
                        "aggs": { GROUPS_AGG: groups }
                    }),
                    SearchMode::Composite,
                    PageStrategy::AfterKey,
                    OutputKeys::Alias,
                )
            }
            QueryShape::Aggregate => {
                let mut body = json!({
                    "size": 0,
                    "track_total_hits": true,
                    "query": query
                });
                if !metrics.is_empty() {
                    body["aggs"] = Value::Object(metrics);
                }
                (body, SearchMode::Totals, PageStrategy::SingleShot, OutputKeys::Alias)
            }
        };

        let compiled = CompiledQuery {
            backend: BackendKind::Elasticsearch,
            native: NativeQuery::Search {
                index: plan.dataset_name.clone(),
                body,
                mode,
            },
            group_count: plan.group_count(),
            shape,
            strategy,
            outputs: plan.outputs(keys),
        };
        tracing::debug!(backend = "elasticsearch", query = %compiled.native, "compiled query");
        Ok(compiled)
    }

    fn page_query(
        &self,
        compiled: &CompiledQuery,
        continuation: Option<&Continuation>,
        batch_size: usize,
    ) -> NativeQuery {
        let NativeQuery::Search { index, body, mode } = &compiled.native else {
            return compiled.native.clone();
        };
        let mut body = body.clone();
        match mode {
            SearchMode::Hits { .. } => {
                body["size"] = json!(batch_size);
            }
            SearchMode::Composite => {
                let composite = &mut body["aggs"][GROUPS_AGG]["composite"];
                composite["size"] = json!(batch_size);
                if let Some(Continuation::AfterKey(after)) = continuation {
                    composite["after"] = after.clone();
                }
            }
            SearchMode::Totals => {}
        }
        NativeQuery::Search {
            index: index.clone(),
            body,
            mode: *mode,
        }
    }
}

fn total_hits(response: &Value) -> Option<u64> {
    let total = response.pointer("/hits/total")?;
    total
        .as_u64()
        .or_else(|| total.get("value").and_then(Value::as_u64))
}

/// Decode one `_search` / `_search/scroll` response body.
pub fn page_from_response(mode: SearchMode, response: &Value) -> Result<Page, EngineError> {
    match mode {
        SearchMode::Hits { .. } => {
            let hits = response
                .pointer("/hits/hits")
                .and_then(Value::as_array)
                .ok_or_else(|| EngineError::Unexpected("search response without hits".into()))?;
            let rows = hits
                .iter()
                .map(|hit| {
                    let mut doc = hit
                        .get("_source")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    // docvalue fields arrive flattened under `fields`.
                    if let Some(fields) = hit.get("fields").and_then(Value::as_object) {
                        for (name, value) in fields {
                            doc.insert(name.clone(), value.clone());
                        }
                    }
                    NativeRow::Document(doc)
                })
                .collect();
            let continuation = response
                .get("_scroll_id")
                .and_then(Value::as_str)
                .map(|id| Continuation::Cursor(id.to_string()));
            Ok(Page::new(rows, continuation))
        }
        SearchMode::Composite => {
            let groups = response
                .pointer(&format!("/aggregations/{GROUPS_AGG}"))
                .ok_or_else(|| {
                    EngineError::Unexpected("search response without group buckets".into())
                })?;
            let buckets = groups
                .get("buckets")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let after = groups
                .get("after_key")
                .cloned()
                .or_else(|| buckets.last().and_then(|b| b.get("key").cloned()));
            let rows = buckets
                .into_iter()
                .map(|bucket| {
                    let Value::Object(mut values) = bucket else {
                        return NativeRow::Bucket {
                            keys: Map::new(),
                            values: Map::new(),
                            doc_count: None,
                        };
                    };
                    let keys = match values.remove("key") {
                        Some(Value::Object(keys)) => keys,
                        _ => Map::new(),
                    };
                    let doc_count = values.remove("doc_count").and_then(|c| c.as_u64());
                    NativeRow::Bucket {
                        keys,
                        values,
                        doc_count,
                    }
                })
                .collect::<Vec<_>>();
            let continuation = if rows.is_empty() {
                None
            } else {
                after.map(Continuation::AfterKey)
            };
            Ok(Page::new(rows, continuation))
        }
        SearchMode::Totals => {
            let values = response
                .get("aggregations")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Ok(Page::new(
                vec![NativeRow::Bucket {
                    keys: Map::new(),
                    values,
                    doc_count: total_hits(response),
                }],
                None,
            ))
        }
    }
}

/// Indices that are never exposed as datasets.
pub fn is_exposed_index(name: &str) -> bool {
    !(name.starts_with("apm-") || name == "index" || name.starts_with('.'))
}

/// Columns of every exposed index in a `GET /_mapping` body, plus the
/// columns of each alias in an optional `GET /_alias` body.
pub fn columns_from_mappings(mappings: &Value, aliases: Option<&Value>) -> Vec<RawColumn> {
    let mut columns = Vec::new();
    let Some(indices) = mappings.as_object() else {
        return columns;
    };
    for (index, body) in indices {
        if !is_exposed_index(index) {
            continue;
        }
        let Some(mapping) = body.get("mappings") else {
            continue;
        };
        // 6.x nests properties under the document type.
        let properties = mapping.get("properties").or_else(|| {
            mapping
                .as_object()
                .and_then(|types| types.values().find_map(|t| t.get("properties")))
        });
        let mut index_columns = Vec::new();
        if let Some(properties) = properties.and_then(Value::as_object) {
            flatten_properties(index, properties, "", &mut index_columns);
        }

        let alias_names: Vec<String> = aliases
            .and_then(|a| a.pointer(&format!("/{}/aliases", escape_pointer(index))))
            .and_then(Value::as_object)
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default();
        for alias in alias_names {
            columns.extend(index_columns.iter().map(|c: &RawColumn| RawColumn {
                dataset: alias.clone(),
                ..c.clone()
            }));
        }
        columns.extend(index_columns);
    }
    columns
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn flatten_properties(
    index: &str,
    properties: &Map<String, Value>,
    prefix: &str,
    out: &mut Vec<RawColumn>,
) {
    for (name, field) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if let Some(nested) = field.get("properties").and_then(Value::as_object) {
            flatten_properties(index, nested, &path, out);
            continue;
        }
        let field_type = field.get("type").and_then(Value::as_str).unwrap_or("object");
        if EXCLUDED_TYPES.contains(&field_type) {
            continue;
        }
        let has_keyword = field_type != "keyword"
            && field.pointer("/fields/keyword/type").and_then(Value::as_str) == Some("keyword");
        out.push(RawColumn {
            dataset: index.to_string(),
            column: path,
            native_type: field_type.to_string(),
            has_keyword,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DatasetSchema, QueryColumn, QueryRequest};
    use crate::query::OutputRole;

    fn schema() -> DatasetSchema {
        let backend = ElasticsearchBackend::new();
        let mappings = json!({
            "Orders": {"mappings": {"properties": {
                "status": {"type": "text", "fields": {"keyword": {"type": "keyword"}}},
                "amount": {"type": "double"},
                "created": {"type": "date"},
                "location": {"type": "geo_point"},
                "customer": {"properties": {"name": {"type": "keyword"}}}
            }}},
            ".kibana": {"mappings": {"properties": {"x": {"type": "keyword"}}}},
            "apm-7": {"mappings": {"properties": {"x": {"type": "keyword"}}}}
        });
        let aliases = json!({"Orders": {"aliases": {"sales": {}}}});
        DatasetSchema::from_columns(
            columns_from_mappings(&mappings, Some(&aliases)),
            backend.type_mapper(),
        )
    }

    fn compile(request: &QueryRequest) -> CompiledQuery {
        let backend = ElasticsearchBackend::new();
        let plan = QueryPlan::build(request, &schema(), backend.filter_options()).unwrap();
        backend.compile_query(&plan).unwrap()
    }

    #[test]
    fn mappings_flatten_and_hide_system_indices() {
        let schema = schema();
        let ids: Vec<_> = schema.datasets().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["orders", "sales"]);
        let orders = schema.dataset("orders").unwrap();
        assert_eq!(orders.native_name, "Orders");
        assert!(orders.column("location").is_none());
        assert!(orders.resolve("status").unwrap().has_keyword);
        assert_eq!(
            orders.resolve("customer.name").unwrap().canonical_type,
            CanonicalType::Hierarchy
        );
        assert_eq!(schema.dataset("sales").unwrap().columns().len(), 4);
    }

    #[test]
    fn no_groups_compile_to_totals() {
        let compiled = compile(
            &QueryRequest::new("orders")
                .column(QueryColumn::wildcard().aggregated(Aggregation::Count))
                .pushdown(true),
        );
        assert_eq!(compiled.shape, QueryShape::Aggregate);
        assert_eq!(compiled.group_count, 0);
        let NativeQuery::Search { body, mode, .. } = &compiled.native else {
            panic!("expected a search");
        };
        assert_eq!(*mode, SearchMode::Totals);
        assert_eq!(body["size"], json!(0));
        assert_eq!(body["track_total_hits"], json!(true));
        assert!(body.get("aggs").is_none());
    }

    #[test]
    fn grouped_queries_page_with_after_key() {
        let compiled = compile(
            &QueryRequest::new("orders")
                .column(QueryColumn::new("status"))
                .column(QueryColumn::new("created").at_level(DateLevel::Month))
                .column(QueryColumn::new("amount").aggregated(Aggregation::Sum))
                .pushdown(true),
        );
        let backend = ElasticsearchBackend::new();
        let after = json!({"c0": "open", "c1": 1_700_000_000_000i64});
        let NativeQuery::Search { body, .. } =
            backend.page_query(&compiled, Some(&Continuation::AfterKey(after.clone())), 500)
        else {
            panic!("expected a search");
        };
        let composite = &body["aggs"][GROUPS_AGG]["composite"];
        assert_eq!(composite["size"], json!(500));
        assert_eq!(composite["after"], after);
        assert_eq!(
            composite["sources"][0]["c0"]["terms"]["field"],
            json!("status.keyword")
        );
        assert_eq!(
            composite["sources"][1]["c1"]["date_histogram"]["calendar_interval"],
            json!("month")
        );
        assert_eq!(
            body["aggs"][GROUPS_AGG]["aggs"]["c2"],
            json!({"sum": {"field": "amount"}})
        );
    }

    #[test]
    fn numeric_equality_is_an_epsilon_range() {
        let compiled = compile(
            &QueryRequest::new("orders")
                .column(QueryColumn::new("amount"))
                .filter(crate::types::Filter::new(
                    "amount",
                    crate::types::FilterExpression::Eq,
                    vec![json!(5)],
                )),
        );
        let NativeQuery::Search { body, .. } = &compiled.native else {
            panic!("expected a search");
        };
        let range = &body["query"]["bool"]["filter"][0]["range"]["amount"];
        assert!(range["gte"].as_f64().unwrap() <= 5.0);
        assert!(range["lte"].as_f64().unwrap() >= 5.0);
    }

    #[test]
    fn row_queries_split_source_and_docvalues() {
        let compiled = compile(
            &QueryRequest::new("orders")
                .column(QueryColumn::new("status"))
                .column(QueryColumn::new("created")),
        );
        assert_eq!(compiled.strategy, PageStrategy::Cursor);
        let NativeQuery::Search { body, .. } = &compiled.native else {
            panic!("expected a search");
        };
        assert_eq!(body["_source"], json!(["status"]));
        assert_eq!(
            body["docvalue_fields"],
            json!([{"field": "created", "format": "epoch_millis"}])
        );
        assert_eq!(compiled.outputs[1].key, "created");
    }

    #[test]
    fn composite_response_falls_back_to_last_bucket_key() {
        let response = json!({
            "aggregations": {"groups": {"buckets": [
                {"key": {"c0": "a"}, "doc_count": 2},
                {"key": {"c0": "b"}, "doc_count": 1}
            ]}}
        });
        let page = page_from_response(SearchMode::Composite, &response).unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.continuation, Some(Continuation::AfterKey(json!({"c0": "b"}))));

        let empty = json!({"aggregations": {"groups": {"buckets": []}}});
        assert_eq!(page_from_response(SearchMode::Composite, &empty).unwrap().continuation, None);
    }

    #[test]
    fn totals_read_the_hit_count() {
        let response = json!({"hits": {"total": {"value": 42, "relation": "eq"}, "hits": []}});
        let page = page_from_response(SearchMode::Totals, &response).unwrap();
        let outputs = vec![crate::query::OutputColumn {
            key: "c0".into(),
            canonical: CanonicalType::Numeric,
            role: OutputRole::RowCount,
        }];
        let row = crate::normalize::normalize(page.rows[0].clone(), &outputs);
        assert_eq!(row, vec![json!(42)]);
    }
}
