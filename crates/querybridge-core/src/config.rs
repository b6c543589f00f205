use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::EngineError;

/// Configuration options for the query engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Time a cached schema stays fresh.
    pub schema_ttl: Duration,

    /// Per-backend schema TTL, overriding `schema_ttl`.
    pub schema_ttl_overrides: HashMap<BackendKind, Duration>,

    /// A column or dataset missing from a cached schema forces a refresh
    /// only once the snapshot is at least this old.
    pub schema_refresh_min_age: Duration,

    /// Budget for one schema fetch.
    pub schema_timeout: Duration,

    /// Budget for the first page of a data query.
    pub query_timeout: Duration,

    /// Budget for every following page.
    pub page_timeout: Duration,

    /// Budget for opening a connector.
    pub connect_timeout: Duration,

    /// Rows or buckets requested per page.
    pub batch_size: usize,

    /// Maximum number of connection identities with a cached schema.
    pub schema_cache_capacity: usize,

    /// Maximum number of live pooled connectors.
    pub pool_capacity: usize,

    /// Pooled connectors unused for this long are closed.
    pub pool_idle_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut schema_ttl_overrides = HashMap::new();
        schema_ttl_overrides.insert(BackendKind::Mysql, Duration::from_secs(24 * 60 * 60));
        Self {
            schema_ttl: Duration::from_secs(5 * 60),
            schema_ttl_overrides,
            schema_refresh_min_age: Duration::from_secs(30),
            schema_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(120),
            page_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            batch_size: 10_000,
            schema_cache_capacity: 1_000,
            pool_capacity: 1_000,
            pool_idle_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl EngineConfig {
    /// Create a new EngineConfig builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overlaid with `QUERYBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_SCHEMA_TTL_SECS")? {
            config.schema_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_MYSQL_SCHEMA_TTL_SECS")? {
            config
                .schema_ttl_overrides
                .insert(BackendKind::Mysql, Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_SCHEMA_REFRESH_MIN_AGE_SECS")? {
            config.schema_refresh_min_age = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_SCHEMA_TIMEOUT_MS")? {
            config.schema_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_QUERY_TIMEOUT_MS")? {
            config.query_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_PAGE_TIMEOUT_MS")? {
            config.page_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, "QUERYBRIDGE_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(entries) = parse_var(&lookup, "QUERYBRIDGE_SCHEMA_CACHE_ENTRIES")? {
            config.schema_cache_capacity = entries;
        }
        if let Some(entries) = parse_var(&lookup, "QUERYBRIDGE_POOL_CAPACITY")? {
            config.pool_capacity = entries;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "QUERYBRIDGE_POOL_IDLE_SECS")? {
            config.pool_idle_ttl = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_size == 0 {
            return Err(EngineError::Configuration(
                "batch size must be positive".into(),
            ));
        }
        if self.schema_cache_capacity == 0 || self.pool_capacity == 0 {
            return Err(EngineError::Configuration(
                "cache and pool capacities must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Schema TTL for a backend, honouring overrides.
    pub fn schema_ttl_for(&self, kind: BackendKind) -> Duration {
        self.schema_ttl_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.schema_ttl)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            EngineError::Configuration(format!("{name} has an invalid value: {raw}"))
        }),
    }
}

/// Builder for EngineConfig.
#[derive(Default)]
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    /// Set the default schema TTL.
    pub fn schema_ttl(mut self, ttl: Duration) -> Self {
        self.config.schema_ttl = ttl;
        self
    }

    /// Override the schema TTL for one backend kind.
    pub fn schema_ttl_for(mut self, kind: BackendKind, ttl: Duration) -> Self {
        self.config.schema_ttl_overrides.insert(kind, ttl);
        self
    }

    /// Set the minimum schema age before a lookup miss forces a refresh.
    pub fn schema_refresh_min_age(mut self, age: Duration) -> Self {
        self.config.schema_refresh_min_age = age;
        self
    }

    /// Set schema fetch timeout.
    pub fn schema_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_timeout = timeout;
        self
    }

    /// Set data query timeout.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    /// Set per-page timeout.
    pub fn page_timeout(mut self, timeout: Duration) -> Self {
        self.config.page_timeout = timeout;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set page size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set schema cache capacity.
    pub fn schema_cache_capacity(mut self, entries: usize) -> Self {
        self.config.schema_cache_capacity = entries;
        self
    }

    /// Set connector pool capacity.
    pub fn pool_capacity(mut self, entries: usize) -> Self {
        self.config.pool_capacity = entries;
        self
    }

    /// Set connector idle TTL.
    pub fn pool_idle_ttl(mut self, ttl: Duration) -> Self {
        self.config.pool_idle_ttl = ttl;
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
