//! Per-backend compilers behind one trait, looked up by [`BackendKind`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connector::Continuation;
use crate::error::EngineError;
use crate::filter::FilterOptions;
use crate::query::{CompiledQuery, NativeQuery, QueryPlan};
use crate::type_mapping::TypeMapper;

pub mod elasticsearch;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod sql;
pub mod sqlserver;

pub use elasticsearch::ElasticsearchBackend;
pub use mongodb::MongoBackend;
pub use sql::{SqlBackend, SqlDialect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mysql,
    Postgres,
    Sqlserver,
    Elasticsearch,
    Mongodb,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Mysql,
        BackendKind::Postgres,
        BackendKind::Sqlserver,
        BackendKind::Elasticsearch,
        BackendKind::Mongodb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mysql => "mysql",
            BackendKind::Postgres => "postgres",
            BackendKind::Sqlserver => "sqlserver",
            BackendKind::Elasticsearch => "elasticsearch",
            BackendKind::Mongodb => "mongodb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(BackendKind::Mysql),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "sqlserver" | "mssql" => Ok(BackendKind::Sqlserver),
            "elasticsearch" | "es" => Ok(BackendKind::Elasticsearch),
            "mongodb" | "mongo" => Ok(BackendKind::Mongodb),
            other => Err(EngineError::BadRequest(format!("unknown backend {other}"))),
        }
    }
}

/// Compilation capabilities of one backend kind.
///
/// Execution goes through a [`crate::connector::Connector`]; a backend only
/// produces native queries and knows how to page them.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn type_mapper(&self) -> &TypeMapper;

    fn filter_options(&self) -> FilterOptions {
        FilterOptions::default()
    }

    fn compile_query(&self, plan: &QueryPlan) -> Result<CompiledQuery, EngineError>;

    /// Native query for the page after `continuation` (the first page when `None`).
    fn page_query(
        &self,
        compiled: &CompiledQuery,
        continuation: Option<&Continuation>,
        batch_size: usize,
    ) -> NativeQuery;
}

/// Backends keyed by kind.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend.
    pub fn builtin() -> Result<Self, EngineError> {
        let mut registry = Self::new();
        registry.register(Arc::new(mysql::backend()));
        registry.register(Arc::new(postgres::backend()?));
        registry.register(Arc::new(sqlserver::backend()?));
        registry.register(Arc::new(ElasticsearchBackend::new()));
        registry.register(Arc::new(MongoBackend::new()));
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.kind(), backend)
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, EngineError> {
        self.backends.get(&kind).cloned().ok_or_else(|| {
            EngineError::Configuration(format!("no backend registered for {kind}"))
        })
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_every_kind() {
        let registry = BackendRegistry::builtin().unwrap();
        assert_eq!(registry.kinds(), BackendKind::ALL.to_vec());
        for kind in BackendKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("PostgreSQL".parse::<BackendKind>().unwrap(), BackendKind::Postgres);
        assert_eq!("mssql".parse::<BackendKind>().unwrap(), BackendKind::Sqlserver);
        assert!("oracle".parse::<BackendKind>().is_err());
    }
}
