use chrono::{DateTime, Utc};

use super::sql::{order_by_clause, SqlBackend, SqlDialect};
use super::BackendKind;
use crate::error::{EngineError, ErrorKind};
use crate::type_mapping::TypeMapper;
use crate::types::{CanonicalType, DateLevel};

/// Declaration order matters: the first matching pattern wins.
const TYPES: &[(&str, CanonicalType)] = &[
    ("money", CanonicalType::Numeric),
    ("^smallint$", CanonicalType::Numeric),
    ("^integer$", CanonicalType::Numeric),
    ("^numeric", CanonicalType::Numeric),
    ("^bigint$", CanonicalType::Numeric),
    ("^decimal", CanonicalType::Numeric),
    ("^double precision$", CanonicalType::Numeric),
    ("^(small|big)?serial$", CanonicalType::Numeric),
    ("^float\\d?$", CanonicalType::Numeric),
    ("^real", CanonicalType::Numeric),
    ("^int[248]?$", CanonicalType::Numeric),
    ("^date$", CanonicalType::Datetime),
    ("^time$", CanonicalType::Datetime),
    ("^timestamp$", CanonicalType::Datetime),
    ("^timestamptz$", CanonicalType::Datetime),
    ("^interval$", CanonicalType::Datetime),
    ("^timestamp(\\(\\d\\))? with(out)? time zone$", CanonicalType::Datetime),
    ("^time(\\(\\d\\))? with(out)? time zone$", CanonicalType::Datetime),
    ("^uuid", CanonicalType::Hierarchy),
    ("^character varying", CanonicalType::Hierarchy),
    ("^varchar", CanonicalType::Hierarchy),
    ("^char", CanonicalType::Hierarchy),
    ("^character", CanonicalType::Hierarchy),
    ("^text$", CanonicalType::Hierarchy),
    ("^boolean$", CanonicalType::Hierarchy),
    ("^bit$", CanonicalType::Hierarchy),
    ("^bit varying", CanonicalType::Hierarchy),
];

const SCHEMA_QUERY: &str = "SELECT table_schema, table_name, column_name, data_type \
FROM information_schema.columns \
WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
ORDER BY table_schema, table_name, ordinal_position";

pub struct PostgresDialect {
    types: TypeMapper,
}

impl PostgresDialect {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            types: TypeMapper::patterns("postgres", TYPES)?,
        })
    }
}

pub fn backend() -> Result<SqlBackend<PostgresDialect>, EngineError> {
    Ok(SqlBackend::new(PostgresDialect::new()?))
}

impl SqlDialect for PostgresDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn type_mapper(&self) -> &TypeMapper {
        &self.types
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn datetime_literal(&self, ts: &DateTime<Utc>) -> String {
        format!("TIMESTAMP '{}'", ts.format("%Y-%m-%d %H:%M:%S%.3f"))
    }

    fn date_trunc(&self, expr: &str, level: DateLevel) -> String {
        let unit = match level {
            DateLevel::Millisecond => "milliseconds",
            other => other.as_str(),
        };
        format!("date_trunc('{unit}', {expr})")
    }

    fn paginate(&self, text: &str, order_by: &[usize], limit: usize, offset: u64) -> String {
        match order_by_clause(order_by) {
            Some(order) => format!("{text} {order} LIMIT {limit} OFFSET {offset}"),
            None => format!("{text} LIMIT {limit} OFFSET {offset}"),
        }
    }

    fn schema_query(&self) -> &'static str {
        SCHEMA_QUERY
    }

    fn error_kind(&self, code: &str) -> ErrorKind {
        match code {
            // undefined_column, undefined_table
            "42703" | "42P01" => ErrorKind::StaleSchema,
            "28P01" | "28000" => ErrorKind::Unauthorized,
            // query_canceled (statement_timeout)
            "57014" => ErrorKind::QueryTimeout,
            "08001" | "08006" | "08004" | "57P03" => ErrorKind::UpstreamUnavailable,
            _ => ErrorKind::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_table_covers_information_schema_names() {
        let dialect = PostgresDialect::new().unwrap();
        let mapper = dialect.type_mapper();
        assert_eq!(mapper.to_canonical("character varying"), CanonicalType::Hierarchy);
        assert_eq!(mapper.to_canonical("numeric(12,2)"), CanonicalType::Numeric);
        assert_eq!(mapper.to_canonical("double precision"), CanonicalType::Numeric);
        assert_eq!(
            mapper.to_canonical("timestamp without time zone"),
            CanonicalType::Datetime
        );
        assert_eq!(mapper.to_canonical("jsonb"), CanonicalType::Hierarchy);
    }

    #[test]
    fn millisecond_truncation_uses_plural_unit() {
        let dialect = PostgresDialect::new().unwrap();
        assert_eq!(
            dialect.date_trunc("\"ts\"", DateLevel::Millisecond),
            "date_trunc('milliseconds', \"ts\")"
        );
        assert_eq!(
            dialect.date_trunc("\"ts\"", DateLevel::Quarter),
            "date_trunc('quarter', \"ts\")"
        );
    }

    #[test]
    fn statement_timeout_is_a_query_timeout() {
        let backend = backend().unwrap();
        assert_eq!(
            backend.classify_error("57014", "canceling statement due to statement timeout").kind(),
            ErrorKind::QueryTimeout
        );
        assert!(backend.classify_error("42P01", "relation does not exist").is_schema_miss());
    }
}
