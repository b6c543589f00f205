//! Per-connection cache of dataset schemas.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::types::DatasetSchema;

/// Stable hash of the credential/host tuple of a connection.
///
/// Two requests built from the same tuple share one cache slot and one
/// pooled connector. The raw credentials are never kept.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    /// Hash labelled parts in the order given.
    pub fn from_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut hasher = Sha256::new();
        for (label, value) in parts {
            hasher.update(label.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0xffu8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionIdentity({self})")
    }
}

struct CacheEntry {
    schema: Arc<DatasetSchema>,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// Schema cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub expired_evictions: u64,
}

/// Bounded, TTL-checked store of [`DatasetSchema`] snapshots.
///
/// Entries are whole `Arc` snapshots, so readers never see a partial update.
/// Fetches for one identity are single-flight: concurrent callers wait on the
/// same per-identity lock and reuse the stored result.
pub struct SchemaCache {
    entries: Mutex<LruCache<ConnectionIdentity, CacheEntry>>,
    fetch_locks: Mutex<HashMap<ConnectionIdentity, Arc<tokio::sync::Mutex<()>>>>,
    stats: Mutex<SchemaCacheStats>,
    default_ttl: Duration,
}

impl SchemaCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            fetch_locks: Mutex::new(HashMap::new()),
            stats: Mutex::new(SchemaCacheStats::default()),
            default_ttl,
        }
    }

    /// Fresh schema for `identity`. A stale entry is evicted and reported as a miss.
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<DatasetSchema>> {
        let mut entries = self.entries.lock();
        let found = entries
            .get(identity)
            .map(|entry| (!entry.is_expired()).then(|| Arc::clone(&entry.schema)));
        let expired = match found {
            Some(Some(schema)) => {
                drop(entries);
                self.stats.lock().hits += 1;
                return Some(schema);
            }
            Some(None) => {
                entries.pop(identity);
                true
            }
            None => false,
        };
        drop(entries);
        let mut stats = self.stats.lock();
        stats.misses += 1;
        if expired {
            stats.expired_evictions += 1;
        }
        None
    }

    /// Replace the entry for `identity` using the default TTL.
    pub fn store(&self, identity: ConnectionIdentity, schema: Arc<DatasetSchema>) {
        self.store_with_ttl(identity, schema, self.default_ttl);
    }

    pub fn store_with_ttl(
        &self,
        identity: ConnectionIdentity,
        schema: Arc<DatasetSchema>,
        ttl: Duration,
    ) {
        let entry = CacheEntry {
            schema,
            stored_at: Instant::now(),
            ttl,
        };
        if let Some((evicted, _)) = self.entries.lock().push(identity.clone(), entry) {
            if evicted != identity {
                tracing::debug!(identity = %evicted, "schema cache full, evicted least recently used");
            }
        }
    }

    /// Time since the entry for `identity` was stored, expired or not.
    pub fn age(&self, identity: &ConnectionIdentity) -> Option<Duration> {
        self.entries
            .lock()
            .peek(identity)
            .map(|entry| entry.stored_at.elapsed())
    }

    pub fn invalidate(&self, identity: &ConnectionIdentity) -> bool {
        self.entries.lock().pop(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SchemaCacheStats {
        self.stats.lock().clone()
    }

    /// Cached schema if fresh, otherwise run `fetch`, store and return it.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        identity: &ConnectionIdentity,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<DatasetSchema>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DatasetSchema, EngineError>>,
    {
        if let Some(schema) = self.get(identity) {
            return Ok(schema);
        }
        let lock = self.fetch_lock(identity);
        let guard = lock.lock().await;
        let result = match self.peek_fresh(identity) {
            Some(schema) => Ok(schema),
            None => self.fetch_and_store(identity, ttl, fetch).await,
        };
        drop(guard);
        self.release_fetch_lock(identity, lock);
        result
    }

    /// Forced refresh.
    ///
    /// `stale` is the snapshot the caller found wanting. When another caller
    /// already replaced it while this one waited for the fetch lock, the newer
    /// snapshot is returned without fetching again. `None` always fetches.
    pub async fn refresh<F, Fut>(
        &self,
        identity: &ConnectionIdentity,
        ttl: Duration,
        stale: Option<&Arc<DatasetSchema>>,
        fetch: F,
    ) -> Result<Arc<DatasetSchema>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DatasetSchema, EngineError>>,
    {
        let lock = self.fetch_lock(identity);
        let guard = lock.lock().await;
        let replaced = match (stale, self.peek_fresh(identity)) {
            (Some(stale), Some(current)) if !Arc::ptr_eq(stale, &current) => Some(current),
            _ => None,
        };
        let result = match replaced {
            Some(current) => Ok(current),
            None => {
                tracing::info!(identity = %identity, "forcing schema refresh");
                self.fetch_and_store(identity, ttl, fetch).await
            }
        };
        drop(guard);
        self.release_fetch_lock(identity, lock);
        result
    }

    /// Like `get` but without touching the statistics.
    fn peek_fresh(&self, identity: &ConnectionIdentity) -> Option<Arc<DatasetSchema>> {
        let mut entries = self.entries.lock();
        entries
            .get(identity)
            .filter(|entry| !entry.is_expired())
            .map(|entry| Arc::clone(&entry.schema))
    }

    async fn fetch_and_store<F, Fut>(
        &self,
        identity: &ConnectionIdentity,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<DatasetSchema>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DatasetSchema, EngineError>>,
    {
        self.stats.lock().fetches += 1;
        let schema = Arc::new(fetch().await?);
        self.store_with_ttl(identity.clone(), Arc::clone(&schema), ttl);
        Ok(schema)
    }

    fn fetch_lock(&self, identity: &ConnectionIdentity) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock();
        Arc::clone(
            locks
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn release_fetch_lock(&self, identity: &ConnectionIdentity, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.fetch_locks.lock();
        drop(lock);
        // Only the map still holds it: nobody is waiting.
        if locks
            .get(identity)
            .map_or(false, |held| Arc::strong_count(held) == 1)
        {
            locks.remove(identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dataset;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(host: &str) -> ConnectionIdentity {
        ConnectionIdentity::from_parts([("host", host), ("user", "reader")])
    }

    fn schema_named(name: &str) -> DatasetSchema {
        let mut schema = DatasetSchema::new();
        schema.insert(Dataset::new(name));
        schema
    }

    #[test]
    fn identity_hides_credentials() {
        let id = ConnectionIdentity::from_parts([("host", "db"), ("password", "hunter2")]);
        assert_eq!(id.as_str().len(), 64);
        assert!(!id.as_str().contains("hunter2"));
        assert_eq!(
            id,
            ConnectionIdentity::from_parts([("host", "db"), ("password", "hunter2")])
        );
        assert_ne!(
            ConnectionIdentity::from_parts([("a", "bc")]),
            ConnectionIdentity::from_parts([("ab", "c")])
        );
    }

    #[test]
    fn stale_entries_are_evicted_on_get() {
        let cache = SchemaCache::new(4, Duration::from_secs(60));
        let id = identity("db1");
        cache.store_with_ttl(id.clone(), Arc::new(schema_named("a")), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired_evictions, 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = SchemaCache::new(2, Duration::from_secs(60));
        for host in ["a", "b", "c"] {
            cache.store(identity(host), Arc::new(schema_named(host)));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&identity("a")).is_none());
        assert!(cache.get(&identity("c")).is_some());
    }

    #[tokio::test]
    async fn get_or_fetch_within_ttl_fetches_once() {
        let cache = SchemaCache::new(4, Duration::from_secs(60));
        let id = identity("db1");
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let schema = cache
                .get_or_fetch(&id, Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(schema_named("orders"))
                })
                .await
                .unwrap();
            assert!(schema.dataset("orders").is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(SchemaCache::new(4, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&identity("db1"), Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(schema_named("orders"))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = SchemaCache::new(4, Duration::from_secs(60));
        let id = identity("db1");
        let err = cache
            .get_or_fetch(&id, Duration::from_secs(60), || async {
                Err(EngineError::UpstreamUnavailable("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
        assert!(cache.get(&id).is_none());
    }

    #[tokio::test]
    async fn refresh_skips_when_snapshot_already_replaced() {
        let cache = SchemaCache::new(4, Duration::from_secs(60));
        let id = identity("db1");
        let stale = Arc::new(schema_named("old"));
        cache.store(id.clone(), Arc::new(schema_named("new")));

        let calls = AtomicUsize::new(0);
        let fresh = cache
            .refresh(&id, Duration::from_secs(60), Some(&stale), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(schema_named("newer"))
            })
            .await
            .unwrap();
        assert!(fresh.dataset("new").is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let forced = cache
            .refresh(&id, Duration::from_secs(60), None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(schema_named("newer"))
            })
            .await
            .unwrap();
        assert!(forced.dataset("newer").is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
