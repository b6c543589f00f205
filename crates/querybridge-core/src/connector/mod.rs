//! The seam between the engine and a live backend connection.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::BackendKind;
use crate::error::EngineError;
use crate::normalize::NativeRow;
use crate::query::NativeQuery;
use crate::schema_cache::ConnectionIdentity;
use crate::types::RawColumn;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

/// Backend-issued handle for the next page.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Rows already consumed.
    Offset(u64),
    /// Server-side cursor or scroll context id.
    Cursor(String),
    /// Composite aggregation key to resume after.
    AfterKey(Value),
}

/// One batch of native rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<NativeRow>,
    pub continuation: Option<Continuation>,
}

impl Page {
    pub fn new(rows: Vec<NativeRow>, continuation: Option<Continuation>) -> Self {
        Self { rows, continuation }
    }
}

/// A connection to one backend, already authenticated by the caller.
///
/// Implementations enforce `timeout` on the backend side where the protocol
/// allows it; the engine additionally bounds every call with the same budget.
/// Errors must be classified into [`EngineError`] kinds, with driver details
/// logged rather than embedded.
#[async_trait]
pub trait Connector: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn identity(&self) -> &ConnectionIdentity;

    async fn connect(&self, timeout: Duration) -> Result<(), EngineError>;

    async fn fetch_schema(&self, timeout: Duration) -> Result<Vec<RawColumn>, EngineError>;

    async fn execute(&self, query: &NativeQuery, timeout: Duration) -> Result<Page, EngineError>;

    /// `query` is the page query built for `continuation`.
    async fn next_page(
        &self,
        query: &NativeQuery,
        continuation: &Continuation,
        timeout: Duration,
    ) -> Result<Page, EngineError>;

    /// Free a server-side cursor the engine will not read any further.
    async fn release(&self, _continuation: &Continuation) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
