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
    ("^int$", CanonicalType::Numeric),
    ("^tinyint$", CanonicalType::Numeric),
    ("^numeric", CanonicalType::Numeric),
    ("^bigint$", CanonicalType::Numeric),
    ("^decimal", CanonicalType::Numeric),
    ("^double precision$", CanonicalType::Numeric),
    ("^serial$", CanonicalType::Numeric),
    ("^float(\\d)?$", CanonicalType::Numeric),
    ("^real", CanonicalType::Numeric),
    ("^date$", CanonicalType::Datetime),
    ("^time$", CanonicalType::Datetime),
    ("^(small)?datetime(\\d)?(offset)?$", CanonicalType::Datetime),
    ("^timestamp$", CanonicalType::Datetime),
    ("^uuid", CanonicalType::Hierarchy),
    ("^(var)?binary$", CanonicalType::Hierarchy),
    ("^xml$", CanonicalType::Hierarchy),
    ("^hierarchyid$", CanonicalType::Hierarchy),
    ("^n?varchar(\\d)?$", CanonicalType::Hierarchy),
    ("^n?char(\\d)?$", CanonicalType::Hierarchy),
    ("^n?text$", CanonicalType::Hierarchy),
    ("^bit$", CanonicalType::Hierarchy),
    ("^uniqueidentifier$", CanonicalType::Hierarchy),
];

const SCHEMA_QUERY: &str = "SELECT table_schema, table_name, column_name, data_type \
FROM information_schema.columns \
WHERE table_schema NOT IN ('information_schema', 'sys') \
ORDER BY table_schema, table_name, ordinal_position";

pub struct SqlServerDialect {
    types: TypeMapper,
}

impl SqlServerDialect {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            types: TypeMapper::patterns("sqlserver", TYPES)?,
        })
    }
}

pub fn backend() -> Result<SqlBackend<SqlServerDialect>, EngineError> {
    Ok(SqlBackend::new(SqlServerDialect::new()?))
}

impl SqlDialect for SqlServerDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlserver
    }

    fn type_mapper(&self) -> &TypeMapper {
        &self.types
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn string_literal(&self, value: &str) -> String {
        format!("N'{}'", value.replace('\'', "''"))
    }

    fn bool_literal(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn datetime_literal(&self, ts: &DateTime<Utc>) -> String {
        format!(
            "CONVERT(datetime2, '{}', 126)",
            ts.format("%Y-%m-%dT%H:%M:%S%.3f")
        )
    }

    fn date_trunc(&self, expr: &str, level: DateLevel) -> String {
        match level {
            DateLevel::Millisecond => expr.to_string(),
            // Weeks start on Monday; day 0 (1900-01-01) is a Monday.
            DateLevel::Week => {
                format!("DATEADD(week, DATEDIFF(week, 0, DATEADD(day, -1, {expr})), 0)")
            }
            // Seconds since 1900 overflow DATEDIFF's int, so count from midnight.
            DateLevel::Second => {
                let midnight = format!("CAST(CAST({expr} AS DATE) AS DATETIME)");
                format!("DATEADD(second, DATEDIFF(second, {midnight}, {expr}), {midnight})")
            }
            other => {
                let unit = other.as_str();
                format!("DATEADD({unit}, DATEDIFF({unit}, 0, {expr}), 0)")
            }
        }
    }

    fn paginate(&self, text: &str, order_by: &[usize], limit: usize, offset: u64) -> String {
        let order = order_by_clause(order_by).unwrap_or_else(|| "ORDER BY (SELECT NULL)".into());
        format!("{text} {order} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
    }

    fn schema_query(&self) -> &'static str {
        SCHEMA_QUERY
    }

    fn error_kind(&self, code: &str) -> ErrorKind {
        match code {
            // invalid column name, invalid object name
            "207" | "208" => ErrorKind::StaleSchema,
            "18456" | "ELOGIN" => ErrorKind::Unauthorized,
            "57014" | "ETIMEOUT" | "-2" => ErrorKind::QueryTimeout,
            "ESOCKET" | "ECONNCLOSED" | "EINSTLOOKUP" => ErrorKind::UpstreamUnavailable,
            _ => ErrorKind::Unexpected,
        }
    }
}
