//! Pushdown query translation and streaming execution.
//!
//! A [`QueryRequest`] names a dataset, the columns to return, filters and
//! whether grouping and aggregation should run inside the backend. The
//! [`QueryEngine`] resolves it against a cached [`DatasetSchema`], compiles
//! it into the backend's native query language (SQL for MySQL, PostgreSQL and
//! SQL Server; search DSL for Elasticsearch; query documents and pipelines
//! for MongoDB), executes it through a [`Connector`] and returns the rows as
//! a lazy stream.

pub mod backend;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod filter;
pub mod normalize;
pub mod pool;
pub mod query;
pub mod schema_cache;
pub mod type_mapping;
pub mod types;

pub use backend::{Backend, BackendKind, BackendRegistry};
pub use config::{ConfigBuilder, EngineConfig};
pub use connector::{Connector, Continuation, Page};
pub use engine::{QueryEngine, RowStream};
pub use error::{EngineError, ErrorKind};
pub use normalize::NativeRow;
pub use pool::ConnectorPool;
pub use query::{CompiledQuery, NativeQuery};
pub use schema_cache::{ConnectionIdentity, SchemaCache};
pub use types::{
    Aggregation, CanonicalType, ColumnInfo, DatasetSchema, DateLevel, Filter, FilterExpression,
    QueryColumn, QueryRequest, RawColumn, ResultRow,
};

#[cfg(feature = "elasticsearch")]
pub use connector::elasticsearch::{ElasticsearchConfig, ElasticsearchConnector};
