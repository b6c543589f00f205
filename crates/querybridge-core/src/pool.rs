//! Live connectors shared across requests of one connection identity.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::error::EngineError;
use crate::schema_cache::ConnectionIdentity;

struct PooledConnector {
    connector: Arc<dyn Connector>,
    last_used: Instant,
}

/// Bounded pool of connected [`Connector`]s.
///
/// Entries idle for longer than the idle TTL are closed and replaced on the
/// next lookup; the least recently used entry is closed when the pool is full.
/// The pool is owned by whoever owns the engine and closed explicitly on
/// shutdown with [`ConnectorPool::close_all`].
pub struct ConnectorPool {
    entries: Mutex<LruCache<ConnectionIdentity, PooledConnector>>,
    idle_ttl: Duration,
    connect_timeout: Duration,
}

impl ConnectorPool {
    pub fn new(capacity: usize, idle_ttl: Duration, connect_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            idle_ttl,
            connect_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.pool_capacity,
            config.pool_idle_ttl,
            config.connect_timeout,
        )
    }

    /// Pooled connector for `identity`, or a new one from `factory`, connected
    /// before it is handed out.
    pub async fn get_or_connect<F>(
        &self,
        identity: &ConnectionIdentity,
        factory: F,
    ) -> Result<Arc<dyn Connector>, EngineError>
    where
        F: FnOnce() -> Result<Arc<dyn Connector>, EngineError>,
    {
        let idle = {
            let mut entries = self.entries.lock();
            let found = entries.get_mut(identity).map(|entry| {
                if entry.last_used.elapsed() > self.idle_ttl {
                    None
                } else {
                    entry.last_used = Instant::now();
                    Some(Arc::clone(&entry.connector))
                }
            });
            match found {
                Some(Some(connector)) => return Ok(connector),
                Some(None) => entries.pop(identity).map(|entry| entry.connector),
                None => None,
            }
        };
        if let Some(idle) = idle {
            tracing::debug!(identity = %identity, "closing idle connector");
            close_quietly(identity, idle).await;
        }

        let connector = factory()?;
        match tokio::time::timeout(self.connect_timeout, connector.connect(self.connect_timeout)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::QueryTimeout(format!(
                    "connect exceeded {} ms",
                    self.connect_timeout.as_millis()
                )))
            }
        }
        tracing::info!(identity = %identity, backend = %connector.backend(), "connector opened");

        let displaced = self.entries.lock().push(
            identity.clone(),
            PooledConnector {
                connector: Arc::clone(&connector),
                last_used: Instant::now(),
            },
        );
        if let Some((displaced_id, entry)) = displaced {
            // Either the LRU victim or a racing connect for the same identity.
            if !Arc::ptr_eq(&entry.connector, &connector) {
                close_quietly(&displaced_id, entry.connector).await;
            }
        }
        Ok(connector)
    }

    /// Remove and close the connector for `identity`.
    pub async fn evict(&self, identity: &ConnectionIdentity) -> bool {
        let removed = self.entries.lock().pop(identity);
        match removed {
            Some(entry) => {
                close_quietly(identity, entry.connector).await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(ConnectionIdentity, PooledConnector)> = {
            let mut entries = self.entries.lock();
            std::iter::from_fn(|| entries.pop_lru()).collect()
        };
        let count = drained.len();
        for (identity, entry) in drained {
            close_quietly(&identity, entry.connector).await;
        }
        tracing::info!(count, "connector pool closed");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn close_quietly(identity: &ConnectionIdentity, connector: Arc<dyn Connector>) {
    if let Err(e) = connector.close().await {
        tracing::warn!(identity = %identity, error = %e, "failed to close connector");
    }
}
