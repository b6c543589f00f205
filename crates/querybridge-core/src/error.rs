use thiserror::Error;

/// Error type for every engine operation.
///
/// The variants map one to one onto the kinds surfaced to callers, see
/// [`EngineError::kind`]. Upstream driver messages stay in the logs; the
/// strings carried here are safe to return to a client.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    DatasetOrColumnNotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("query timeout: {0}")]
    QueryTimeout(String),
    #[error("stale schema: {0}")]
    StaleSchema(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

/// Coarse classification of an [`EngineError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    DatasetOrColumnNotFound,
    Unauthorized,
    QueryTimeout,
    StaleSchema,
    UpstreamUnavailable,
    Cancelled,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::DatasetOrColumnNotFound => "dataset_or_column_not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QueryTimeout => "query_timeout",
            ErrorKind::StaleSchema => "stale_schema",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::BadRequest(_) => ErrorKind::BadRequest,
            EngineError::DatasetOrColumnNotFound(_) => ErrorKind::DatasetOrColumnNotFound,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::QueryTimeout(_) => ErrorKind::QueryTimeout,
            EngineError::StaleSchema(_) => ErrorKind::StaleSchema,
            EngineError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Configuration(_) | EngineError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// True when a forced schema refresh might make a retry succeed.
    pub fn is_schema_miss(&self) -> bool {
        matches!(
            self,
            EngineError::StaleSchema(_) | EngineError::DatasetOrColumnNotFound(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::BadRequest(format!("malformed json: {err}"))
    }
}
