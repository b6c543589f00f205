use chrono::{DateTime, Utc};

use super::sql::{order_by_clause, SqlBackend, SqlDialect};
use super::BackendKind;
use crate::error::ErrorKind;
use crate::type_mapping::TypeMapper;
use crate::types::{CanonicalType, DateLevel};

const TYPES: &[(&str, CanonicalType)] = &[
    ("integer", CanonicalType::Numeric),
    ("int", CanonicalType::Numeric),
    ("smallint", CanonicalType::Numeric),
    ("tinyint", CanonicalType::Numeric),
    ("mediumint", CanonicalType::Numeric),
    ("bigint", CanonicalType::Numeric),
    ("decimal", CanonicalType::Numeric),
    ("numeric", CanonicalType::Numeric),
    ("float", CanonicalType::Numeric),
    ("double", CanonicalType::Numeric),
    ("bit", CanonicalType::Hierarchy),
    ("date", CanonicalType::Datetime),
    ("datetime", CanonicalType::Datetime),
    ("timestamp", CanonicalType::Datetime),
    ("time", CanonicalType::Datetime),
    ("year", CanonicalType::Datetime),
    ("char", CanonicalType::Hierarchy),
    ("varchar", CanonicalType::Hierarchy),
    ("binary", CanonicalType::Hierarchy),
    ("varbinary", CanonicalType::Hierarchy),
    ("text", CanonicalType::Hierarchy),
    ("tinytext", CanonicalType::Hierarchy),
    ("mediumtext", CanonicalType::Hierarchy),
    ("longtext", CanonicalType::Hierarchy),
    ("enum", CanonicalType::Hierarchy),
    ("set", CanonicalType::Hierarchy),
    ("json", CanonicalType::Hierarchy),
    ("string", CanonicalType::Hierarchy),
];

const SCHEMA_QUERY: &str = "SELECT tbl.table_schema, tbl.table_name, col.column_name, col.data_type \
FROM information_schema.tables tbl \
JOIN information_schema.columns col ON tbl.table_schema = col.table_schema AND tbl.table_name = col.table_name \
WHERE tbl.table_schema NOT IN ('information_schema', 'mysql', 'sys', 'performance_schema') \
ORDER BY tbl.table_schema, tbl.table_name, col.ordinal_position";

/// MySQL and MariaDB.
pub struct MySqlDialect {
    types: TypeMapper,
}

impl MySqlDialect {
    pub fn new() -> Self {
        Self {
            types: TypeMapper::literal("mysql", TYPES),
        }
    }
}

impl Default for MySqlDialect {
    fn default() -> Self {
        Self::new()
    }
}

pub fn backend() -> SqlBackend<MySqlDialect> {
    SqlBackend::new(MySqlDialect::new())
}

impl SqlDialect for MySqlDialect {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
    }

    fn type_mapper(&self) -> &TypeMapper {
        &self.types
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn datetime_literal(&self, ts: &DateTime<Utc>) -> String {
        format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.3f"))
    }

    fn date_trunc(&self, expr: &str, level: DateLevel) -> String {
        let unit = match level {
            DateLevel::Millisecond => return expr.to_string(),
            DateLevel::Second => "SECOND",
            DateLevel::Minute => "MINUTE",
            DateLevel::Hour => "HOUR",
            DateLevel::Day => "DAY",
            DateLevel::Week => "WEEK",
            DateLevel::Month => "MONTH",
            DateLevel::Quarter => "QUARTER",
            DateLevel::Year => "YEAR",
        };
        format!("DATE_ADD('1900-01-01', INTERVAL TIMESTAMPDIFF({unit}, '1900-01-01', {expr}) {unit})")
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
            // ER_BAD_FIELD_ERROR, ER_NO_SUCH_TABLE, ER_BAD_TABLE_ERROR
            "1054" | "1146" | "1051" | "ER_BAD_FIELD_ERROR" | "ER_NO_SUCH_TABLE" => {
                ErrorKind::StaleSchema
            }
            "1045" | "1044" | "ER_ACCESS_DENIED_ERROR" => ErrorKind::Unauthorized,
            // ER_QUERY_TIMEOUT, ER_QUERY_INTERRUPTED
            "3024" | "1317" => ErrorKind::QueryTimeout,
            "2002" | "2003" | "2005" | "2013" | "ECONNREFUSED" | "ENOTFOUND" => {
                ErrorKind::UpstreamUnavailable
            }
            _ => ErrorKind::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn literals_escape_quotes_and_backslashes() {
        let dialect = MySqlDialect::new();
        assert_eq!(dialect.quote_ident("we`ird"), "`we``ird`");
        assert_eq!(dialect.string_literal(r"it's a \ test"), r"'it''s a \\ test'");
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 0).unwrap();
        assert_eq!(dialect.datetime_literal(&ts), "'2024-02-29 13:05:00.000'");
    }

    #[test]
    fn truncation_uses_a_fixed_origin() {
        let dialect = MySqlDialect::new();
        assert_eq!(
            dialect.date_trunc("`created_at`", DateLevel::Month),
            "DATE_ADD('1900-01-01', INTERVAL TIMESTAMPDIFF(MONTH, '1900-01-01', `created_at`) MONTH)"
        );
        assert_eq!(dialect.date_trunc("`t`", DateLevel::Millisecond), "`t`");
    }

    #[test]
    fn unknown_columns_are_stale_schema() {
        let backend = backend();
        let err = backend.classify_error("1054", "Unknown column 'x' in 'field list'");
        assert!(err.is_schema_miss());
        assert!(!err.to_string().contains("field list"));
        assert_eq!(
            backend.classify_error("1045", "Access denied").kind(),
            ErrorKind::Unauthorized
        );
    }

    #[test]
    fn type_table_ignores_display_width() {
        let dialect = MySqlDialect::new();
        let mapper = dialect.type_mapper();
        assert_eq!(mapper.to_canonical("INT(11)"), CanonicalType::Numeric);
        assert_eq!(mapper.to_canonical("decimal(10,2)"), CanonicalType::Numeric);
        assert_eq!(mapper.to_canonical("datetime(3)"), CanonicalType::Datetime);
        assert_eq!(mapper.to_canonical("geometry"), CanonicalType::Hierarchy);
    }
}
