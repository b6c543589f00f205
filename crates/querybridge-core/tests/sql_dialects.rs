use querybridge_core::backend::{mysql, postgres, sqlserver, Backend, SqlBackend, SqlDialect};
use querybridge_core::filter::FilterOptions;
use querybridge_core::query::{NativeQuery, QueryPlan, QueryShape};
use querybridge_core::{
    Aggregation, CompiledQuery, DatasetSchema, DateLevel, Filter, FilterExpression, QueryColumn,
    QueryRequest, RawColumn,
};
use serde_json::{json, Value};
use sqlparser::dialect::{Dialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

fn orders<D: SqlDialect>(backend: &SqlBackend<D>, table: &str, types: [&str; 3]) -> DatasetSchema {
    DatasetSchema::from_columns(
        vec![
            RawColumn::new(table, "id", types[0]),
            RawColumn::new(table, "created_at", types[1]),
            RawColumn::new(table, "status", types[2]),
        ],
        backend.type_mapper(),
    )
}

fn compile<D: SqlDialect>(
    backend: &SqlBackend<D>,
    schema: &DatasetSchema,
    request: QueryRequest,
) -> CompiledQuery {
    let plan = QueryPlan::build(&request, schema, backend.filter_options()).unwrap();
    backend.compile_query(&plan).unwrap()
}

fn page_text<D: SqlDialect>(backend: &SqlBackend<D>, compiled: &CompiledQuery) -> String {
    match backend.page_query(compiled, None, 500) {
        NativeQuery::Sql { text, .. } => text,
        other => panic!("expected SQL, got {other}"),
    }
}

fn where_clause(compiled: &CompiledQuery) -> String {
    let NativeQuery::Sql { text, .. } = &compiled.native else {
        panic!("expected SQL");
    };
    let start = text.find(" WHERE ").expect("no WHERE clause") + " WHERE ".len();
    let end = text.find(" GROUP BY ").unwrap_or(text.len());
    text[start..end].to_string()
}

fn status_filter(expression: FilterExpression, values: Vec<Value>) -> String {
    let backend = mysql::backend();
    let schema = orders(&backend, "orders", ["int", "datetime", "varchar(32)"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("orders")
            .column(QueryColumn::new("id"))
            .filter(Filter::new("status", expression, values)),
    );
    where_clause(&compiled)
}

fn assert_parses(dialect: &dyn Dialect, sql: &str) {
    if let Err(e) = Parser::parse_sql(dialect, sql) {
        panic!("{sql}\ndoes not parse: {e}");
    }
}

#[test]
fn in_with_null_adds_an_or_is_null() {
    assert_eq!(
        status_filter(FilterExpression::In, vec![json!("A"), json!("B"), Value::Null]),
        "(`status` IN ('A', 'B') OR `status` IS NULL)"
    );
    assert_eq!(
        status_filter(FilterExpression::In, vec![json!("A"), json!("B")]),
        "`status` IN ('A', 'B')"
    );
}

#[test]
fn not_in_null_handling_matches_two_valued_semantics() {
    assert_eq!(
        status_filter(FilterExpression::NotIn, vec![json!("A"), Value::Null]),
        "(`status` NOT IN ('A') OR `status` IS NULL)"
    );
    assert_eq!(
        status_filter(FilterExpression::NotIn, vec![json!("A"), json!("B")]),
        "(`status` NOT IN ('A', 'B') AND `status` IS NOT NULL)"
    );
}

#[test]
fn null_only_and_empty_lists() {
    assert_eq!(
        status_filter(FilterExpression::In, vec![Value::Null]),
        "`status` IS NULL"
    );
    assert_eq!(status_filter(FilterExpression::In, vec![]), "1 = 0");
    assert_eq!(status_filter(FilterExpression::NotIn, vec![Value::Null]), "1 = 1");
    assert_eq!(
        status_filter(FilterExpression::NotIn, vec![]),
        "`status` IS NOT NULL"
    );
    assert_eq!(
        status_filter(FilterExpression::IsNotNull, vec![]),
        "`status` IS NOT NULL"
    );
}

#[test]
fn hierarchy_inequality_is_a_direct_comparison() {
    let backend = mysql::backend();
    let schema = orders(&backend, "orders", ["int", "datetime", "varchar(32)"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("orders")
            .column(QueryColumn::new("status"))
            .column(QueryColumn::new("id").aggregated(Aggregation::Count))
            .filter(Filter::new("status", FilterExpression::Ne, vec![json!("closed")]))
            .pushdown(true),
    );
    assert_eq!(compiled.shape, QueryShape::Grouped);
    assert_eq!(compiled.group_count, 1);
    assert_eq!(
        compiled.native,
        NativeQuery::Sql {
            text: "SELECT `status` AS `c0`, COUNT(`id`) AS `c1` FROM `orders` \
                   WHERE `status` <> 'closed' GROUP BY `status`"
                .into(),
            order_by: vec![1],
        }
    );
    assert_parses(&MySqlDialect {}, &page_text(&backend, &compiled));
}

#[test]
fn count_without_groups_is_a_single_row_aggregate() {
    let backend = postgres::backend().unwrap();
    let schema = orders(&backend, "public.orders", ["integer", "timestamp", "text"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("public.orders")
            .column(QueryColumn::wildcard().aggregated(Aggregation::Count))
            .pushdown(true),
    );
    assert_eq!(compiled.shape, QueryShape::Aggregate);
    assert_eq!(compiled.group_count, 0);
    let text = page_text(&backend, &compiled);
    assert_eq!(text, "SELECT COUNT(*) AS \"c0\" FROM \"public\".\"orders\"");
    assert!(!text.contains("GROUP BY"));
    assert!(!text.contains("LIMIT"));
    assert_parses(&PostgreSqlDialect {}, &text);
}

#[test]
fn postgres_grouped_dates_page_in_order() {
    let backend = postgres::backend().unwrap();
    let schema = orders(&backend, "public.orders", ["integer", "timestamp", "text"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("public.orders")
            .column(QueryColumn::new("created_at").at_level(DateLevel::Month))
            .column(QueryColumn::new("id").aggregated(Aggregation::Sum))
            .filter(Filter::new(
                "created_at",
                FilterExpression::Ge,
                vec![json!("2024-01-01T00:00:00Z")],
            ))
            .pushdown(true),
    );
    let text = page_text(&backend, &compiled);
    assert_eq!(
        text,
        "SELECT date_trunc('month', \"created_at\") AS \"c0\", SUM(\"id\") AS \"c1\" \
         FROM \"public\".\"orders\" WHERE \"created_at\" >= TIMESTAMP '2024-01-01 00:00:00.000' \
         GROUP BY date_trunc('month', \"created_at\") ORDER BY 1 LIMIT 500 OFFSET 0"
    );
    assert_parses(&PostgreSqlDialect {}, &text);
}

#[test]
fn sqlserver_rows_page_with_offset_fetch() {
    let backend = sqlserver::backend().unwrap();
    let schema = orders(&backend, "dbo.orders", ["int", "datetime2", "nvarchar"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("dbo.orders")
            .column(QueryColumn::new("status"))
            .column(QueryColumn::new("id"))
            .filter(Filter::new(
                "status",
                FilterExpression::NotIn,
                vec![json!("it's"), json!("done")],
            )),
    );
    assert_eq!(compiled.shape, QueryShape::Rows);
    let text = page_text(&backend, &compiled);
    assert_eq!(
        text,
        "SELECT [status] AS [c0], [id] AS [c1] FROM [dbo].[orders] \
         WHERE ([status] NOT IN (N'it''s', N'done') AND [status] IS NOT NULL) \
         ORDER BY 1, 2 OFFSET 0 ROWS FETCH NEXT 500 ROWS ONLY"
    );
    assert_parses(&MsSqlDialect {}, &text);
}

#[test]
fn numeric_equality_is_exact_in_sql() {
    let backend = mysql::backend();
    let schema = orders(&backend, "orders", ["int", "datetime", "varchar(32)"]);
    let compiled = compile(
        &backend,
        &schema,
        QueryRequest::new("orders")
            .column(QueryColumn::new("id"))
            .filter(Filter::new("id", FilterExpression::Eq, vec![json!(7)])),
    );
    assert_eq!(where_clause(&compiled), "`id` = 7");
    assert_eq!(FilterOptions::default(), backend.filter_options());
}
