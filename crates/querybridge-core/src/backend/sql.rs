//! SQL generation shared by every relational dialect.

use chrono::{DateTime, Utc};

use super::{Backend, BackendKind};
use crate::connector::Continuation;
use crate::error::{EngineError, ErrorKind};
use crate::filter::{Literal, Predicate};
use crate::query::{
    alias, CompiledQuery, NativeQuery, OutputKeys, PageStrategy, Projection, QueryPlan, QueryShape,
};
use crate::type_mapping::TypeMapper;
use crate::types::{Aggregation, CanonicalType, ColumnInfo, DateLevel};

/// The parts of SQL that differ between engines.
pub trait SqlDialect: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn type_mapper(&self) -> &TypeMapper;

    fn quote_ident(&self, ident: &str) -> String;

    /// `schema.table` with each part quoted.
    fn quote_table(&self, dataset: &str) -> String {
        dataset
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn bool_literal(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    fn datetime_literal(&self, ts: &DateTime<Utc>) -> String;

    /// Truncate `expr` to the start of its `level` period.
    fn date_trunc(&self, expr: &str, level: DateLevel) -> String;

    fn count_distinct(&self, expr: &str) -> String {
        format!("COUNT(DISTINCT {expr})")
    }

    /// Append the paging clause for one batch.
    fn paginate(&self, text: &str, order_by: &[usize], limit: usize, offset: u64) -> String;

    /// Lists `table_schema, table_name, column_name, data_type` of every user table.
    fn schema_query(&self) -> &'static str;

    /// Classify a driver error code (SQLSTATE or vendor number).
    fn error_kind(&self, code: &str) -> ErrorKind;
}

/// [`Backend`] implementation for any [`SqlDialect`].
pub struct SqlBackend<D> {
    dialect: D,
}

impl<D: SqlDialect> SqlBackend<D> {
    pub fn new(dialect: D) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    pub fn schema_query(&self) -> &'static str {
        self.dialect.schema_query()
    }

    /// Build a client-safe error from a driver failure; the driver message is only logged.
    pub fn classify_error(&self, code: &str, message: &str) -> EngineError {
        let kind = self.dialect.error_kind(code);
        tracing::warn!(
            backend = %self.dialect.kind(),
            code,
            message,
            error_kind = %kind,
            "backend statement failed"
        );
        match kind {
            ErrorKind::StaleSchema | ErrorKind::DatasetOrColumnNotFound => EngineError::StaleSchema(
                format!("backend reported an unknown table or column (code {code})"),
            ),
            ErrorKind::Unauthorized => {
                EngineError::Unauthorized("backend rejected the credentials".into())
            }
            ErrorKind::QueryTimeout => {
                EngineError::QueryTimeout("backend cancelled the statement after its timeout".into())
            }
            ErrorKind::UpstreamUnavailable => {
                EngineError::UpstreamUnavailable("backend is unreachable".into())
            }
            _ => EngineError::Unexpected(format!("backend error (code {code})")),
        }
    }

    fn column_expr(&self, column: &ColumnInfo, level: Option<DateLevel>) -> String {
        let quoted = self.dialect.quote_ident(&column.native_name);
        match level {
            Some(level) if column.canonical_type == CanonicalType::Datetime => {
                self.dialect.date_trunc(&quoted, level)
            }
            _ => quoted,
        }
    }

    fn aggregate(&self, aggregation: Aggregation, expr: &str) -> String {
        match aggregation {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::Distinctcount => self.dialect.count_distinct(expr),
        }
    }

    fn literal(&self, literal: &Literal) -> String {
        match literal {
            Literal::Number(n) => format_number(*n),
            Literal::Text(s) => self.dialect.string_literal(s),
            Literal::Bool(b) => self.dialect.bool_literal(*b),
            Literal::Timestamp(ts) => self.dialect.datetime_literal(ts),
        }
    }

    /// Render one predicate as a boolean SQL expression.
    pub fn render_predicate(&self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Compare { column, op, value } => format!(
                "{} {} {}",
                self.dialect.quote_ident(&column.native_name),
                op.sql_operator(),
                self.literal(value)
            ),
            Predicate::Between {
                column,
                low,
                high,
                negated,
            } => {
                let col = self.dialect.quote_ident(&column.native_name);
                let (low, high) = (self.literal(low), self.literal(high));
                if *negated {
                    format!("({col} < {low} OR {col} > {high})")
                } else {
                    format!("({col} >= {low} AND {col} <= {high})")
                }
            }
            Predicate::InList {
                column,
                values,
                negated,
            } => format!(
                "{} {}IN ({})",
                self.dialect.quote_ident(&column.native_name),
                if *negated { "NOT " } else { "" },
                values
                    .iter()
                    .map(|v| self.literal(v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Predicate::IsNull { column, negated } => format!(
                "{} IS {}NULL",
                self.dialect.quote_ident(&column.native_name),
                if *negated { "NOT " } else { "" }
            ),
            Predicate::Any(parts) => self.join(parts, " OR ", false),
            Predicate::All(parts) => self.join(parts, " AND ", true),
            Predicate::Constant(value) => constant(*value).to_string(),
        }
    }

    fn join(&self, parts: &[Predicate], separator: &str, empty: bool) -> String {
        match parts {
            [] => constant(empty).to_string(),
            [single] => self.render_predicate(single),
            _ => format!(
                "({})",
                parts
                    .iter()
                    .map(|p| self.render_predicate(p))
                    .collect::<Vec<_>>()
                    .join(separator)
            ),
        }
    }
}

fn constant(value: bool) -> &'static str {
    if value {
        "1 = 1"
    } else {
        "1 = 0"
    }
}

/// Integral values print without a decimal point, never in exponent form.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        (n as i64).to_string()
    } else {
        format!("{n}")
    }
}

impl<D: SqlDialect> Backend for SqlBackend<D> {
    fn kind(&self) -> BackendKind {
        self.dialect.kind()
    }

    fn type_mapper(&self) -> &TypeMapper {
        self.dialect.type_mapper()
    }

    fn compile_query(&self, plan: &QueryPlan) -> Result<CompiledQuery, EngineError> {
        let mut select = Vec::with_capacity(plan.projections.len());
        let mut group_by = Vec::new();
        let mut order_by = Vec::new();

        for (i, projection) in plan.projections.iter().enumerate() {
            let expr = match projection {
                Projection::Column { column, level } => {
                    let expr = self.column_expr(column, *level);
                    if plan.pushdown {
                        group_by.push(expr.clone());
                    }
                    order_by.push(i + 1);
                    expr
                }
                Projection::Aggregate {
                    column,
                    aggregation,
                } => self.aggregate(*aggregation, &self.dialect.quote_ident(&column.native_name)),
                Projection::RowCount => "COUNT(*)".to_string(),
                Projection::Unit => "1".to_string(),
            };
            select.push(format!("{expr} AS {}", self.dialect.quote_ident(&alias(i))));
        }

        let mut text = format!(
            "SELECT {} FROM {}",
            select.join(", "),
            self.dialect.quote_table(&plan.dataset_name)
        );
        if !plan.predicates.is_empty() {
            let clauses: Vec<String> = plan
                .predicates
                .iter()
                .map(|p| self.render_predicate(p))
                .collect();
            text.push_str(" WHERE ");
            text.push_str(&clauses.join(" AND "));
        }
        if !group_by.is_empty() {
            text.push_str(" GROUP BY ");
            text.push_str(&group_by.join(", "));
        }

        let shape = plan.shape();
        let compiled = CompiledQuery {
            backend: self.kind(),
            native: NativeQuery::Sql { text, order_by },
            group_count: plan.group_count(),
            shape,
            strategy: match shape {
                QueryShape::Aggregate => PageStrategy::SingleShot,
                QueryShape::Rows | QueryShape::Grouped => PageStrategy::Offset,
            },
            outputs: plan.outputs(OutputKeys::Alias),
        };
        tracing::debug!(backend = %self.kind(), query = %compiled.native, "compiled query");
        Ok(compiled)
    }

    fn page_query(
        &self,
        compiled: &CompiledQuery,
        continuation: Option<&Continuation>,
        batch_size: usize,
    ) -> NativeQuery {
        match (&compiled.native, compiled.strategy) {
            (NativeQuery::Sql { text, order_by }, PageStrategy::Offset) => {
                let offset = match continuation {
                    Some(Continuation::Offset(offset)) => *offset,
                    _ => 0,
                };
                NativeQuery::Sql {
                    text: self.dialect.paginate(text, order_by, batch_size, offset),
                    order_by: order_by.clone(),
                }
            }
            (native, _) => native.clone(),
        }
    }
}

/// `ORDER BY 1, 2` for the given ordinals, empty when there are none.
pub(crate) fn order_by_clause(order_by: &[usize]) -> Option<String> {
    if order_by.is_empty() {
        return None;
    }
    Some(format!(
        "ORDER BY {}",
        order_by
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_never_use_exponents() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(1e-17), "0.00000000000000001");
    }

    #[test]
    fn ordinals_render_in_order() {
        assert_eq!(order_by_clause(&[1, 3]).as_deref(), Some("ORDER BY 1, 3"));
        assert_eq!(order_by_clause(&[]), None);
    }
}
