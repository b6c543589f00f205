//! Compile, execute and page a query into a lazy row stream.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendKind, BackendRegistry};
use crate::config::EngineConfig;
use crate::connector::{Connector, Continuation, Page};
use crate::error::EngineError;
use crate::normalize::{empty_aggregate, normalize, NativeRow};
use crate::query::{CompiledQuery, PageStrategy, QueryPlan, QueryShape};
use crate::schema_cache::SchemaCache;
use crate::types::{DatasetDescriptor, DatasetSchema, QueryRequest, ResultRow};

/// Rows in request column order, fetched page by page as the consumer pulls.
pub type RowStream = BoxStream<'static, Result<ResultRow, EngineError>>;

pub struct QueryEngine {
    config: EngineConfig,
    registry: BackendRegistry,
    schemas: SchemaCache,
}

impl QueryEngine {
    /// Engine with every built-in backend.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_registry(config, BackendRegistry::builtin()?)
    }

    pub fn with_registry(config: EngineConfig, registry: BackendRegistry) -> Result<Self, EngineError> {
        config.validate()?;
        let schemas = SchemaCache::new(config.schema_cache_capacity, config.schema_ttl);
        Ok(Self {
            config,
            registry,
            schemas,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Cached schema of the connection, fetched when missing or expired.
    pub async fn schema(&self, connector: &dyn Connector) -> Result<Arc<DatasetSchema>, EngineError> {
        let ttl = self.config.schema_ttl_for(connector.backend());
        self.schemas
            .get_or_fetch(connector.identity(), ttl, || self.load_schema(connector))
            .await
    }

    /// Replace the cached schema. See [`SchemaCache::refresh`] for `stale`.
    pub async fn refresh_schema(
        &self,
        connector: &dyn Connector,
        stale: Option<&Arc<DatasetSchema>>,
    ) -> Result<Arc<DatasetSchema>, EngineError> {
        let ttl = self.config.schema_ttl_for(connector.backend());
        self.schemas
            .refresh(connector.identity(), ttl, stale, || self.load_schema(connector))
            .await
    }

    /// Freshly fetched dataset listing, sorted by dataset id.
    pub async fn datasets(&self, connector: &dyn Connector) -> Result<Vec<DatasetDescriptor>, EngineError> {
        let schema = self.refresh_schema(connector, None).await?;
        Ok(schema.descriptors())
    }

    /// Compile without executing. A lookup miss refreshes the schema once.
    pub async fn compile(
        &self,
        request: &QueryRequest,
        connector: &dyn Connector,
    ) -> Result<CompiledQuery, EngineError> {
        let kind = connector.backend();
        let schema = self.schema(connector).await?;
        match self.compile_with_schema(kind, request, &schema) {
            Err(err) if self.refresh_warranted(&err, connector) => {
                tracing::info!(dataset = %request.dataset_id, error = %err, "schema miss, refreshing");
                let fresh = self.refresh_schema(connector, Some(&schema)).await?;
                self.compile_with_schema(kind, request, &fresh)
            }
            other => other,
        }
    }

    pub fn compile_with_schema(
        &self,
        kind: BackendKind,
        request: &QueryRequest,
        schema: &DatasetSchema,
    ) -> Result<CompiledQuery, EngineError> {
        let backend = self.registry.get(kind)?;
        let plan = QueryPlan::build(request, schema, backend.filter_options())?;
        backend.compile_query(&plan)
    }

    /// Lazy row stream for `request`.
    ///
    /// Compilation and the first page happen before this returns, so request
    /// and schema errors surface here. A stale schema reported by either step
    /// triggers one forced refresh and one retry. Pages after the first are
    /// fetched on demand; cancelling `cancel` or dropping the stream releases
    /// any open server-side cursor.
    pub async fn query(
        &self,
        request: &QueryRequest,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<RowStream, EngineError> {
        let backend = self.registry.get(connector.backend())?;
        let schema = guarded(
            &cancel,
            self.config.schema_timeout,
            "schema fetch",
            self.schema(connector.as_ref()),
        )
        .await?;

        let (compiled, first) = match self.start(&backend, request, &schema, connector.as_ref(), &cancel).await {
            Err(err) if self.refresh_warranted(&err, connector.as_ref()) => {
                tracing::info!(
                    dataset = %request.dataset_id,
                    identity = %connector.identity(),
                    error = %err,
                    "schema miss, refreshing and retrying once"
                );
                let fresh = guarded(
                    &cancel,
                    self.config.schema_timeout,
                    "schema refresh",
                    self.refresh_schema(connector.as_ref(), Some(&schema)),
                )
                .await?;
                self.start(&backend, request, &fresh, connector.as_ref(), &cancel).await?
            }
            other => other?,
        };

        let mut pager = Pager {
            backend,
            connector,
            compiled,
            buffer: VecDeque::new(),
            next: None,
            open_cursor: None,
            fetched: 0,
            batch_size: self.config.batch_size,
            page_timeout: self.config.page_timeout,
            cancel,
        };
        pager.absorb(first);
        Ok(pager.into_stream())
    }

    /// Buffered variant of [`QueryEngine::query`].
    pub async fn query_collect(
        &self,
        request: &QueryRequest,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<Vec<ResultRow>, EngineError> {
        self.query(request, connector, cancel).await?.try_collect().await
    }

    async fn start(
        &self,
        backend: &Arc<dyn Backend>,
        request: &QueryRequest,
        schema: &DatasetSchema,
        connector: &dyn Connector,
        cancel: &CancellationToken,
    ) -> Result<(CompiledQuery, Page), EngineError> {
        let plan = QueryPlan::build(request, schema, backend.filter_options())?;
        let compiled = backend.compile_query(&plan)?;
        let first = backend.page_query(&compiled, None, self.config.batch_size);
        tracing::debug!(
            dataset = %plan.dataset_id,
            backend = %compiled.backend,
            shape = ?compiled.shape,
            "executing query"
        );
        let budget = self.config.query_timeout;
        let page = guarded(cancel, budget, "query", connector.execute(&first, budget)).await?;
        Ok((compiled, page))
    }

    /// Whether `err` justifies a forced schema refresh and one retry.
    ///
    /// A backend-reported stale schema always does. A lookup miss against
    /// the cached snapshot only does once that snapshot reached
    /// `schema_refresh_min_age`, so repeated bad requests stay off the backend.
    fn refresh_warranted(&self, err: &EngineError, connector: &dyn Connector) -> bool {
        match err {
            EngineError::StaleSchema(_) => true,
            EngineError::DatasetOrColumnNotFound(_) => {
                let age = self.schemas.age(connector.identity());
                let refresh = age.map_or(true, |age| age >= self.config.schema_refresh_min_age);
                if !refresh {
                    tracing::debug!(identity = %connector.identity(), error = %err, "schema too recent to refresh");
                }
                refresh
            }
            _ => false,
        }
    }

    async fn load_schema(&self, connector: &dyn Connector) -> Result<DatasetSchema, EngineError> {
        let backend = self.registry.get(connector.backend())?;
        let budget = self.config.schema_timeout;
        let columns = match tokio::time::timeout(budget, connector.fetch_schema(budget)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::QueryTimeout(format!(
                    "schema fetch exceeded {} ms",
                    budget.as_millis()
                )))
            }
        };
        let schema = DatasetSchema::from_columns(columns, backend.type_mapper());
        tracing::info!(
            identity = %connector.identity(),
            backend = %connector.backend(),
            datasets = schema.len(),
            "schema loaded"
        );
        Ok(schema)
    }
}

/// Run `fut` under a time budget, giving up early when `cancel` fires.
async fn guarded<T, F>(
    cancel: &CancellationToken,
    budget: Duration,
    what: &str,
    fut: F,
) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled(format!("{what} cancelled by caller"))),
        outcome = tokio::time::timeout(budget, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(EngineError::QueryTimeout(format!(
                "{what} exceeded {} ms",
                budget.as_millis()
            ))),
        },
    }
}

struct Pager {
    backend: Arc<dyn Backend>,
    connector: Arc<dyn Connector>,
    compiled: CompiledQuery,
    buffer: VecDeque<NativeRow>,
    next: Option<Continuation>,
    /// Latest server-side cursor that has not been exhausted.
    open_cursor: Option<Continuation>,
    fetched: u64,
    batch_size: usize,
    page_timeout: Duration,
    cancel: CancellationToken,
}

impl Pager {
    /// Queue a page and decide whether another one follows.
    ///
    /// Paging stops on a short batch or when the backend hands out no
    /// continuation.
    fn absorb(&mut self, page: Page) {
        if self.fetched == 0 && page.rows.is_empty() && self.compiled.shape == QueryShape::Aggregate {
            // Some backends emit nothing when no documents match.
            self.buffer.push_back(empty_aggregate(&self.compiled.outputs));
        }
        let full = page.rows.len() >= self.batch_size;
        self.fetched += page.rows.len() as u64;
        self.buffer.extend(page.rows);
        self.open_cursor = match &page.continuation {
            Some(cursor @ Continuation::Cursor(_)) => Some(cursor.clone()),
            _ => None,
        };
        self.next = match self.compiled.strategy {
            PageStrategy::SingleShot => None,
            PageStrategy::Offset => full.then_some(Continuation::Offset(self.fetched)),
            PageStrategy::Cursor | PageStrategy::AfterKey => page.continuation.filter(|_| full),
        };
    }

    async fn next_row(&mut self) -> Result<Option<ResultRow>, EngineError> {
        loop {
            if self.cancel.is_cancelled() {
                self.release_cursor().await;
                return Err(EngineError::Cancelled("query cancelled by caller".into()));
            }
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(normalize(row, &self.compiled.outputs)));
            }
            let Some(continuation) = self.next.take() else {
                self.release_cursor().await;
                return Ok(None);
            };
            let query = self
                .backend
                .page_query(&self.compiled, Some(&continuation), self.batch_size);
            let fetched = guarded(
                &self.cancel,
                self.page_timeout,
                "page fetch",
                self.connector.next_page(&query, &continuation, self.page_timeout),
            )
            .await;
            let page = match fetched {
                Ok(page) => page,
                Err(err) => {
                    self.release_cursor().await;
                    return Err(err);
                }
            };
            tracing::trace!(rows = page.rows.len(), fetched = self.fetched, "page fetched");
            self.absorb(page);
        }
    }

    async fn release_cursor(&mut self) {
        if let Some(cursor) = self.open_cursor.take() {
            if let Err(e) = self.connector.release(&cursor).await {
                tracing::warn!(identity = %self.connector.identity(), error = %e, "failed to release cursor");
            }
        }
    }

    fn into_stream(self) -> RowStream {
        stream::try_unfold(self, |mut pager| async move {
            let row = pager.next_row().await?;
            Ok::<_, EngineError>(row.map(|row| (row, pager)))
        })
        .boxed()
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let Some(cursor) = self.open_cursor.take() else {
            return;
        };
        let connector = Arc::clone(&self.connector);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = connector.release(&cursor).await {
                        tracing::warn!(identity = %connector.identity(), error = %e, "failed to release cursor");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(identity = %self.connector.identity(), "no runtime left to release cursor");
            }
        }
    }
}
