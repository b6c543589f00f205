//! Elasticsearch over its REST API.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::{Connector, Continuation, Page};
use crate::backend::elasticsearch::{columns_from_mappings, page_from_response};
use crate::backend::BackendKind;
use crate::error::{EngineError, ErrorKind};
use crate::query::{NativeQuery, SearchMode};
use crate::schema_cache::ConnectionIdentity;
use crate::types::RawColumn;

#[derive(Clone)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long the cluster keeps a scroll context between pages.
    pub scroll_keep_alive: String,
}

impl ElasticsearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            username: None,
            password: None,
            scroll_keep_alive: "1m".into(),
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn scroll_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.scroll_keep_alive = keep_alive.into();
        self
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::from_parts([
            ("backend", BackendKind::Elasticsearch.as_str()),
            ("url", self.url.as_str()),
            ("user", self.username.as_deref().unwrap_or("")),
            ("password", self.password.as_deref().unwrap_or("")),
        ])
    }
}

impl fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("scroll_keep_alive", &self.scroll_keep_alive)
            .finish()
    }
}

/// Error types whose reason names a field or index the mapping lacks.
const STALE_MARKERS: &[&str] = &["no mapping found", "unknown field", "no such index", "no such field"];

/// `(type, reason)` of the error and its root causes in a rejection body.
fn error_causes(body: &Value) -> Vec<(&str, &str)> {
    let Some(error) = body.get("error") else {
        return Vec::new();
    };
    let mut nodes = vec![error];
    if let Some(Value::Array(causes)) = error.get("root_cause") {
        nodes.extend(causes);
    }
    if let Some(cause) = error.get("caused_by") {
        nodes.push(cause);
    }
    nodes
        .into_iter()
        .map(|node| {
            (
                node.get("type").and_then(Value::as_str).unwrap_or_default(),
                node.get("reason").and_then(Value::as_str).unwrap_or_default(),
            )
        })
        .collect()
}

fn names_missing_mapping(body: &Value) -> bool {
    error_causes(body).into_iter().any(|(kind, reason)| {
        let reason = reason.to_lowercase();
        kind == "index_not_found_exception"
            || (matches!(kind, "query_shard_exception" | "illegal_argument_exception")
                && STALE_MARKERS.iter().any(|marker| reason.contains(marker)))
    })
}

/// Maps a rejected request onto an error kind.
///
/// Only rejections naming a missing index or field count as a stale
/// schema; other client errors are not worth a refresh.
pub fn classify_status(status: StatusCode, body: &Value) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Unauthorized,
        400 | 404 if names_missing_mapping(body) => ErrorKind::StaleSchema,
        400 => ErrorKind::BadRequest,
        408 | 504 => ErrorKind::QueryTimeout,
        500..=599 => ErrorKind::UpstreamUnavailable,
        _ => ErrorKind::Unexpected,
    }
}

fn status_error(status: StatusCode, detail: &str) -> EngineError {
    let body = serde_json::from_str(detail).unwrap_or(Value::Null);
    let message = format!("elasticsearch responded with status {}", status.as_u16());
    match classify_status(status, &body) {
        ErrorKind::Unauthorized => EngineError::Unauthorized(message),
        ErrorKind::StaleSchema => EngineError::StaleSchema(message),
        ErrorKind::BadRequest => EngineError::BadRequest(message),
        ErrorKind::QueryTimeout => EngineError::QueryTimeout(message),
        ErrorKind::UpstreamUnavailable => EngineError::UpstreamUnavailable(message),
        _ => EngineError::Unexpected(message),
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    tracing::warn!(backend = "elasticsearch", error = %err, "request failed");
    if err.is_timeout() {
        EngineError::QueryTimeout("elasticsearch request timed out".into())
    } else if err.is_connect() {
        EngineError::UpstreamUnavailable("cannot reach elasticsearch".into())
    } else if err.is_decode() {
        EngineError::Unexpected("malformed elasticsearch response".into())
    } else {
        EngineError::UpstreamUnavailable("elasticsearch request failed".into())
    }
}

/// Path and query string of the initial search request.
pub fn search_path(index: &str, mode: SearchMode, keep_alive: &str) -> String {
    match mode {
        SearchMode::Hits { scroll: true } => format!("/{index}/_search?scroll={keep_alive}"),
        _ => format!("/{index}/_search"),
    }
}

pub struct ElasticsearchConnector {
    client: reqwest::Client,
    config: ElasticsearchConfig,
    identity: ConnectionIdentity,
}

impl ElasticsearchConnector {
    pub fn new(config: ElasticsearchConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {e}")))?;
        let identity = config.identity();
        Ok(Self {
            client,
            config,
            identity,
        })
    }

    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let url = format!("{}{}", self.config.url, path);
        let mut request = self.client.request(method, &url).timeout(timeout);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(
                backend = "elasticsearch",
                status = status.as_u16(),
                path,
                detail = %detail,
                "request rejected"
            );
            return Err(status_error(status, &detail));
        }
        response.json::<Value>().await.map_err(transport_error)
    }

    async fn scroll(&self, scroll_id: &str, mode: SearchMode, timeout: Duration) -> Result<Page, EngineError> {
        let body = json!({
            "scroll": self.config.scroll_keep_alive,
            "scroll_id": scroll_id
        });
        let response = self
            .request(Method::POST, "/_search/scroll", Some(&body), timeout)
            .await?;
        page_from_response(mode, &response)
    }
}

#[async_trait]
impl Connector for ElasticsearchConnector {
    fn backend(&self) -> BackendKind {
        BackendKind::Elasticsearch
    }

    fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    async fn connect(&self, timeout: Duration) -> Result<(), EngineError> {
        let info = self.request(Method::GET, "/", None, timeout).await?;
        tracing::info!(
            backend = "elasticsearch",
            identity = %self.identity,
            version = info.pointer("/version/number").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "connected"
        );
        Ok(())
    }

    async fn fetch_schema(&self, timeout: Duration) -> Result<Vec<RawColumn>, EngineError> {
        let mappings = self.request(Method::GET, "/_mapping", None, timeout).await?;
        let aliases = match self.request(Method::GET, "/_alias", None, timeout).await {
            Ok(aliases) => Some(aliases),
            Err(err) => {
                tracing::debug!(error = %err, "alias listing unavailable");
                None
            }
        };
        Ok(columns_from_mappings(&mappings, aliases.as_ref()))
    }

    async fn execute(&self, query: &NativeQuery, timeout: Duration) -> Result<Page, EngineError> {
        let NativeQuery::Search { index, body, mode } = query else {
            return Err(EngineError::Unexpected(
                "elasticsearch cannot run a non-search query".into(),
            ));
        };
        let path = search_path(index, *mode, &self.config.scroll_keep_alive);
        let response = self.request(Method::POST, &path, Some(body), timeout).await?;
        page_from_response(*mode, &response)
    }

    async fn next_page(
        &self,
        query: &NativeQuery,
        continuation: &Continuation,
        timeout: Duration,
    ) -> Result<Page, EngineError> {
        match (query, continuation) {
            (NativeQuery::Search { mode, .. }, Continuation::Cursor(scroll_id)) => {
                self.scroll(scroll_id, *mode, timeout).await
            }
            // The page query already carries the composite `after` key.
            _ => self.execute(query, timeout).await,
        }
    }

    async fn release(&self, continuation: &Continuation) -> Result<(), EngineError> {
        let Continuation::Cursor(scroll_id) = continuation else {
            return Ok(());
        };
        let body = json!({ "scroll_id": scroll_id });
        self.request(Method::DELETE, "/_search/scroll", Some(&body), Duration::from_secs(10))
            .await?;
        tracing::debug!(backend = "elasticsearch", "scroll context released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_error_kinds() {
        let empty = Value::Null;
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, &empty), ErrorKind::Unauthorized);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT, &empty), ErrorKind::QueryTimeout);
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, &empty),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(classify_status(StatusCode::CONFLICT, &empty), ErrorKind::Unexpected);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, &empty), ErrorKind::Unexpected);
    }

    #[test]
    fn only_missing_mappings_count_as_stale() {
        let missing_index = json!({
            "error": {
                "root_cause": [{ "type": "index_not_found_exception", "reason": "no such index [sales]" }],
                "type": "index_not_found_exception",
                "reason": "no such index [sales]"
            },
            "status": 404
        });
        assert_eq!(classify_status(StatusCode::NOT_FOUND, &missing_index), ErrorKind::StaleSchema);

        let unknown_field = json!({
            "error": {
                "root_cause": [{ "type": "query_shard_exception", "reason": "No mapping found for [amount] in order to sort on" }],
                "type": "search_phase_execution_exception",
                "reason": "all shards failed"
            }
        });
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, &unknown_field), ErrorKind::StaleSchema);

        let fielddata = json!({
            "error": {
                "root_cause": [{
                    "type": "illegal_argument_exception",
                    "reason": "Text fields are not optimised for operations that require per-document field data. Set fielddata=true on [store.name]"
                }],
                "type": "search_phase_execution_exception",
                "reason": "all shards failed"
            }
        });
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, &fielddata), ErrorKind::BadRequest);
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, &fielddata.to_string()),
            EngineError::BadRequest(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "not json"),
            EngineError::BadRequest(_)
        ));
    }

    #[test]
    fn only_row_searches_open_a_scroll() {
        assert_eq!(
            search_path("logs", SearchMode::Hits { scroll: true }, "2m"),
            "/logs/_search?scroll=2m"
        );
        assert_eq!(search_path("logs", SearchMode::Composite, "2m"), "/logs/_search");
    }

    #[test]
    fn identity_depends_on_credentials_but_debug_hides_them() {
        let anonymous = ElasticsearchConfig::new("http://localhost:9200/");
        let alice = anonymous.clone().credentials("alice", "s3cret");
        let alice_again = ElasticsearchConfig::new("http://localhost:9200").credentials("alice", "s3cret");
        assert_eq!(anonymous.url, "http://localhost:9200");
        assert_ne!(anonymous.identity(), alice.identity());
        assert_eq!(alice.identity(), alice_again.identity());
        assert!(!format!("{alice:?}").contains("s3cret"));
    }
}
