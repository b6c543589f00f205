//! Request validation and the backend-neutral query plan.

use std::fmt;

use serde_json::Value;

use crate::backend::BackendKind;
use crate::error::EngineError;
use crate::filter::{compile_filters, FilterOptions, Predicate};
use crate::types::{
    Aggregation, CanonicalType, ColumnInfo, DatasetSchema, DateLevel, QueryRequest,
};

/// What one requested column turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// A raw value, or a group key in pushdown mode.
    Column {
        column: ColumnInfo,
        level: Option<DateLevel>,
    },
    Aggregate {
        column: ColumnInfo,
        aggregation: Aggregation,
    },
    /// `*` in pushdown mode.
    RowCount,
    /// `*` in row mode: the constant 1.
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// Raw rows, no reduction.
    Rows,
    /// Pushdown with at least one group key.
    Grouped,
    /// Pushdown without group keys: exactly one row.
    Aggregate,
}

/// How the engine walks the result of a compiled query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStrategy {
    SingleShot,
    Offset,
    Cursor,
    AfterKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRole {
    Value,
    /// `count`/`distinctcount` of a column: zero over no rows.
    Count,
    RowCount,
    Unit,
}

/// Where the normalizer finds one output value and how it is coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub key: String,
    pub canonical: CanonicalType,
    pub role: OutputRole,
}

/// How output keys are named in native results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKeys {
    /// Positional aliases `c0`, `c1`, … for every column.
    Alias,
    /// Native field names for plain columns, aliases for the rest.
    NativeName,
}

pub fn alias(position: usize) -> String {
    format!("c{position}")
}

/// Validated request with every column resolved against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub dataset_id: String,
    /// Native dataset name used for quoting.
    pub dataset_name: String,
    pub projections: Vec<Projection>,
    pub predicates: Vec<Predicate>,
    pub pushdown: bool,
}

impl QueryPlan {
    pub fn build(
        request: &QueryRequest,
        schema: &DatasetSchema,
        options: FilterOptions,
    ) -> Result<Self, EngineError> {
        if request.columns.is_empty() {
            return Err(EngineError::BadRequest("no columns provided".into()));
        }
        let dataset = schema.resolve(&request.dataset_id)?;
        let pushdown = request.pushdown;

        let mut projections = Vec::with_capacity(request.columns.len());
        for requested in &request.columns {
            if requested.is_wildcard() {
                match requested.aggregation {
                    None | Some(Aggregation::Count) => {}
                    Some(other) => {
                        return Err(EngineError::BadRequest(format!(
                            "aggregation {other} is not valid on *"
                        )))
                    }
                }
                projections.push(if pushdown {
                    Projection::RowCount
                } else {
                    Projection::Unit
                });
                continue;
            }

            let column = dataset.resolve(&requested.column_id)?.clone();
            match (pushdown, requested.aggregation) {
                (true, Some(aggregation)) => {
                    check_aggregation(aggregation, &column)?;
                    projections.push(Projection::Aggregate {
                        column,
                        aggregation,
                    });
                }
                (_, aggregation) => {
                    if aggregation.is_some() {
                        tracing::debug!(column = %column.column_id, "aggregation ignored without pushdown");
                    }
                    let level = match requested.level {
                        Some(level) if pushdown && column.canonical_type == CanonicalType::Datetime => {
                            Some(level)
                        }
                        Some(level) => {
                            tracing::debug!(column = %column.column_id, %level, "date level ignored");
                            None
                        }
                        None => None,
                    };
                    projections.push(Projection::Column { column, level });
                }
            }
        }

        let predicates = compile_filters(&request.filters, dataset, options)?;
        Ok(Self {
            dataset_id: dataset.id.clone(),
            dataset_name: dataset.native_name.clone(),
            projections,
            predicates,
            pushdown,
        })
    }

    pub fn group_count(&self) -> usize {
        if !self.pushdown {
            return 0;
        }
        self.projections
            .iter()
            .filter(|p| matches!(p, Projection::Column { .. }))
            .count()
    }

    pub fn shape(&self) -> QueryShape {
        match (self.pushdown, self.group_count()) {
            (false, _) => QueryShape::Rows,
            (true, 0) => QueryShape::Aggregate,
            (true, _) => QueryShape::Grouped,
        }
    }

    pub fn outputs(&self, keys: OutputKeys) -> Vec<OutputColumn> {
        self.projections
            .iter()
            .enumerate()
            .map(|(i, projection)| match projection {
                Projection::Column { column, .. } => OutputColumn {
                    key: match keys {
                        OutputKeys::NativeName if !self.pushdown => column.native_name.clone(),
                        _ => alias(i),
                    },
                    canonical: column.canonical_type,
                    role: OutputRole::Value,
                },
                Projection::Aggregate {
                    column,
                    aggregation,
                } => OutputColumn {
                    key: alias(i),
                    canonical: match aggregation {
                        Aggregation::Min | Aggregation::Max => column.canonical_type,
                        _ => CanonicalType::Numeric,
                    },
                    role: if aggregation.is_count() {
                        OutputRole::Count
                    } else {
                        OutputRole::Value
                    },
                },
                Projection::RowCount => OutputColumn {
                    key: alias(i),
                    canonical: CanonicalType::Numeric,
                    role: OutputRole::RowCount,
                },
                Projection::Unit => OutputColumn {
                    key: alias(i),
                    canonical: CanonicalType::Numeric,
                    role: OutputRole::Unit,
                },
            })
            .collect()
    }
}

fn check_aggregation(aggregation: Aggregation, column: &ColumnInfo) -> Result<(), EngineError> {
    let valid = match aggregation {
        Aggregation::Count | Aggregation::Distinctcount => true,
        Aggregation::Sum => column.canonical_type == CanonicalType::Numeric,
        Aggregation::Min | Aggregation::Max => column.canonical_type != CanonicalType::Hierarchy,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::BadRequest(format!(
            "aggregation {aggregation} is not supported on {} column {}",
            column.canonical_type, column.column_id
        )))
    }
}

/// How a search request is executed and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Hits { scroll: bool },
    Composite,
    Totals,
}

/// Backend-native query text or document.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeQuery {
    Sql {
        text: String,
        /// 1-based select-list ordinals giving a deterministic page order.
        order_by: Vec<usize>,
    },
    Search {
        index: String,
        body: Value,
        mode: SearchMode,
    },
    Find {
        namespace: String,
        filter: Value,
        projection: Value,
        batch_size: Option<usize>,
    },
    Aggregate {
        namespace: String,
        pipeline: Vec<Value>,
        batch_size: Option<usize>,
    },
}

impl NativeQuery {
    pub fn render(&self) -> String {
        match self {
            NativeQuery::Sql { text, .. } => text.clone(),
            NativeQuery::Search { index, body, .. } => format!("POST /{index}/_search {body}"),
            NativeQuery::Find {
                namespace,
                filter,
                projection,
                ..
            } => format!("{namespace}.find({filter}, {projection})"),
            NativeQuery::Aggregate {
                namespace,
                pipeline,
                ..
            } => format!("{namespace}.aggregate({})", Value::Array(pipeline.clone())),
        }
    }
}

impl fmt::Display for NativeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A query ready to hand to a connector.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub backend: BackendKind,
    pub native: NativeQuery,
    /// Number of group keys, 0 when nothing is grouped.
    pub group_count: usize,
    pub shape: QueryShape,
    pub strategy: PageStrategy,
    pub outputs: Vec<OutputColumn>,
}
