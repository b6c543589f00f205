use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::type_mapping::TypeMapper;

/// Column id that stands for "every row" in a request.
pub const WILDCARD: &str = "*";

/// Backend-independent column classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalType {
    Numeric,
    Datetime,
    Hierarchy,
}

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Numeric => "numeric",
            CanonicalType::Datetime => "datetime",
            CanonicalType::Hierarchy => "hierarchy",
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a dataset, as produced by a schema fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Lower-cased, unique within the dataset.
    pub column_id: String,
    pub native_name: String,
    pub canonical_type: CanonicalType,
    pub native_type: String,
    pub dataset_id: String,
    /// Search backends only: the text field has an exact-match `keyword` sub-field.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_keyword: bool,
}

/// A column as reported by a connector before type mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawColumn {
    /// Native dataset name (`schema.table`, index name, `db.collection`).
    pub dataset: String,
    pub column: String,
    pub native_type: String,
    #[serde(default)]
    pub has_keyword: bool,
}

impl RawColumn {
    pub fn new(
        dataset: impl Into<String>,
        column: impl Into<String>,
        native_type: impl Into<String>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            column: column.into(),
            native_type: native_type.into(),
            has_keyword: false,
        }
    }
}

/// All columns of one dataset, in the order the backend reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub native_name: String,
    columns: Vec<ColumnInfo>,
    index: HashMap<String, usize>,
}

impl Dataset {
    pub fn new(native_name: impl Into<String>) -> Self {
        let native_name = native_name.into();
        Self {
            id: native_name.to_lowercase(),
            native_name,
            columns: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Adds a column unless one with the same case-folded id already exists.
    pub fn push(&mut self, column: ColumnInfo) -> bool {
        if self.index.contains_key(&column.column_id) {
            return false;
        }
        self.index
            .insert(column.column_id.clone(), self.columns.len());
        self.columns.push(column);
        true
    }

    pub fn column(&self, column_id: &str) -> Option<&ColumnInfo> {
        self.index
            .get(&column_id.to_lowercase())
            .map(|&i| &self.columns[i])
    }

    pub fn resolve(&self, column_id: &str) -> Result<&ColumnInfo, EngineError> {
        self.column(column_id).ok_or_else(|| {
            EngineError::DatasetOrColumnNotFound(format!(
                "column {column_id} does not exist in dataset {}",
                self.id
            ))
        })
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }
}

/// Snapshot of every dataset reachable through one connection.
///
/// Built once per schema fetch and shared behind an `Arc`; a refresh replaces
/// the whole snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetSchema {
    datasets: BTreeMap<String, Dataset>,
}

impl DatasetSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps raw connector columns through `mapper`. Duplicate column ids
    /// within a dataset keep the first occurrence.
    pub fn from_columns(columns: Vec<RawColumn>, mapper: &TypeMapper) -> Self {
        let mut schema = Self::new();
        for raw in columns {
            let dataset_id = raw.dataset.to_lowercase();
            let dataset = schema
                .datasets
                .entry(dataset_id.clone())
                .or_insert_with(|| Dataset::new(raw.dataset.clone()));
            let info = ColumnInfo {
                column_id: raw.column.to_lowercase(),
                canonical_type: mapper.to_canonical(&raw.native_type),
                native_name: raw.column,
                native_type: raw.native_type,
                dataset_id,
                has_keyword: raw.has_keyword,
            };
            let column_id = info.column_id.clone();
            if !dataset.push(info) {
                tracing::warn!(
                    dataset = %dataset.id,
                    column = %column_id,
                    "duplicate column id after case folding; keeping the first"
                );
            }
        }
        schema
    }

    pub fn insert(&mut self, dataset: Dataset) {
        self.datasets.insert(dataset.id.clone(), dataset);
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<&Dataset> {
        self.datasets.get(&dataset_id.to_lowercase())
    }

    pub fn resolve(&self, dataset_id: &str) -> Result<&Dataset, EngineError> {
        self.dataset(dataset_id).ok_or_else(|| {
            EngineError::DatasetOrColumnNotFound(format!("dataset {dataset_id} does not exist"))
        })
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Dataset listing sorted by id.
    pub fn descriptors(&self) -> Vec<DatasetDescriptor> {
        self.datasets
            .values()
            .map(|dataset| DatasetDescriptor {
                id: dataset.id.clone(),
                name: dataset.native_name.clone(),
                columns: dataset
                    .columns()
                    .iter()
                    .map(|c| ColumnDescriptor {
                        id: c.column_id.clone(),
                        name: c.native_name.clone(),
                        column_type: c.canonical_type,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: CanonicalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    Count,
    #[serde(alias = "distinct_count")]
    Distinctcount,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Count => "count",
            Aggregation::Distinctcount => "distinctcount",
        }
    }

    /// Count-like aggregations always produce numbers.
    pub fn is_count(&self) -> bool {
        matches!(self, Aggregation::Count | Aggregation::Distinctcount)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Date truncation level. Ordering follows granularity: `Year` is the largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateLevel {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl DateLevel {
    pub const ALL: [DateLevel; 9] = [
        DateLevel::Year,
        DateLevel::Quarter,
        DateLevel::Month,
        DateLevel::Week,
        DateLevel::Day,
        DateLevel::Hour,
        DateLevel::Minute,
        DateLevel::Second,
        DateLevel::Millisecond,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DateLevel::Millisecond => "millisecond",
            DateLevel::Second => "second",
            DateLevel::Minute => "minute",
            DateLevel::Hour => "hour",
            DateLevel::Day => "day",
            DateLevel::Week => "week",
            DateLevel::Month => "month",
            DateLevel::Quarter => "quarter",
            DateLevel::Year => "year",
        }
    }
}

impl fmt::Display for DateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        DateLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == lower)
            .ok_or_else(|| EngineError::BadRequest(format!("unknown date level {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryColumn {
    #[serde(alias = "columnId")]
    pub column_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<DateLevel>,
}

impl QueryColumn {
    pub fn new(column_id: impl Into<String>) -> Self {
        Self {
            column_id: column_id.into(),
            aggregation: None,
            level: None,
        }
    }

    pub fn wildcard() -> Self {
        Self::new(WILDCARD)
    }

    pub fn aggregated(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn at_level(mut self, level: DateLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.column_id == WILDCARD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterExpression {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "is null")]
    IsNull,
    #[serde(rename = "is not null")]
    IsNotNull,
}

impl FilterExpression {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterExpression::Eq => "=",
            FilterExpression::Ne => "<>",
            FilterExpression::Lt => "<",
            FilterExpression::Le => "<=",
            FilterExpression::Gt => ">",
            FilterExpression::Ge => ">=",
            FilterExpression::In => "in",
            FilterExpression::NotIn => "not in",
            FilterExpression::IsNull => "is null",
            FilterExpression::IsNotNull => "is not null",
        }
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(alias = "columnId")]
    pub column_id: String,
    pub expression: FilterExpression,
    /// JSON `null` entries are the null marker of `in` / `not in`.
    #[serde(default)]
    pub value: Vec<Value>,
}

impl Filter {
    pub fn new(column_id: impl Into<String>, expression: FilterExpression, value: Vec<Value>) -> Self {
        Self {
            column_id: column_id.into(),
            expression,
            value,
        }
    }
}

/// A parsed query request as handed over by the transport shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "id", alias = "dataset_id", alias = "datasetId")]
    pub dataset_id: String,
    #[serde(default)]
    pub columns: Vec<QueryColumn>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub pushdown: bool,
}

impl QueryRequest {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            pushdown: false,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn column(mut self, column: QueryColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn pushdown(mut self, pushdown: bool) -> Self {
        self.pushdown = pushdown;
        self
    }
}

/// One output row, a value per requested column in request order.
pub type ResultRow = Vec<Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_levels_order_by_granularity() {
        assert!(DateLevel::Year > DateLevel::Quarter);
        assert!(DateLevel::Week > DateLevel::Day);
        assert!(DateLevel::Second > DateLevel::Millisecond);
        assert_eq!("Month".parse::<DateLevel>().unwrap(), DateLevel::Month);
        assert!("fortnight".parse::<DateLevel>().is_err());
    }

    #[test]
    fn request_accepts_camel_case_column_ids() {
        let request = QueryRequest::from_json(
            br#"{
                "id": "orders",
                "columns": [{"columnId": "status"}, {"column_id": "*", "aggregation": "count"}],
                "filters": [{"columnId": "status", "expression": "not in", "value": ["A", null]}],
                "pushdown": true
            }"#,
        )
        .unwrap();
        assert_eq!(request.columns[0].column_id, "status");
        assert!(request.columns[1].is_wildcard());
        assert_eq!(request.columns[1].aggregation, Some(Aggregation::Count));
        assert_eq!(request.filters[0].expression, FilterExpression::NotIn);
        assert_eq!(request.filters[0].value, vec![json!("A"), Value::Null]);
        assert!(request.pushdown);
    }

    #[test]
    fn unknown_filter_expression_is_a_bad_request() {
        let err = QueryRequest::from_json(
            br#"{"id": "orders", "columns": [], "filters": [{"column_id": "a", "expression": "like"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[test]
    fn column_lookup_is_case_insensitive() {
        let mut dataset = Dataset::new("Shop.Orders");
        assert!(dataset.push(ColumnInfo {
            column_id: "createdat".into(),
            native_name: "CreatedAt".into(),
            canonical_type: CanonicalType::Datetime,
            native_type: "datetime".into(),
            dataset_id: "shop.orders".into(),
            has_keyword: false,
        }));
        assert_eq!(dataset.id, "shop.orders");
        assert_eq!(dataset.resolve("CREATEDAT").unwrap().native_name, "CreatedAt");
        assert!(matches!(
            dataset.resolve("missing"),
            Err(EngineError::DatasetOrColumnNotFound(_))
        ));
    }
}
