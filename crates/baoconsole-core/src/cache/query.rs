use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::canonical_namespace;

/// Results younger than this are served without a refetch.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.cached_at).num_seconds()
    }

    pub fn age_display(&self) -> String {
        let seconds = self.age_seconds();
        if seconds < 5 {
            // Also covers clock skew
            "just now".to_string()
        } else if seconds < 60 {
            format!("{}s ago", seconds)
        } else if seconds < 3600 {
            format!("{}m ago", seconds / 60)
        } else {
            format!("{}h ago", seconds / 3600)
        }
    }

    pub fn is_stale(&self, stale_time: Duration) -> bool {
        let stale = i64::try_from(stale_time.as_secs()).unwrap_or(i64::MAX);
        self.age_seconds() >= stale
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

/// (namespace, query key). Root is stored as the empty string.
type CacheKey = (String, String);

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    generation: u64,
}

/// In-memory query results tagged with the namespace they were fetched in.
///
/// `invalidate_all` bumps a generation; a fetch that started under an older
/// generation returns its result to the caller but never stores it.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    stale_time: Duration,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TIME)
    }
}

impl QueryCache {
    pub fn new(stale_time: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                generation: 0,
            })),
            stale_time,
        }
    }

    fn key(namespace: Option<&str>, key: &str) -> CacheKey {
        (canonical_namespace(namespace).unwrap_or_default().to_string(), key.to_string())
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value for `key` in `namespace`, stale or not.
    pub fn get<T>(&self, namespace: Option<&str>, key: &str) -> Option<CachedData<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.inner.lock().entries.get(&Self::key(namespace, key)).cloned()?;
        entry.downcast_ref::<CachedData<T>>().cloned()
    }

    pub fn insert<T>(&self, namespace: Option<&str>, key: &str, data: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry: Entry = Arc::new(CachedData::new(data));
        self.inner.lock().entries.insert(Self::key(namespace, key), entry);
    }

    /// Drop every entry and fence off fetches already in flight.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.generation += 1;
        debug!(generation = inner.generation, "Query cache invalidated");
    }

    /// Drop entries whose key starts with `prefix`, in every namespace.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|(_, key), _| !key.starts_with(prefix));
    }

    /// Serve a fresh cached value or run `fetch` and cache its result.
    pub async fn fetch<T, E, F, Fut>(&self, namespace: Option<&str>, key: &str, fetch: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(namespace, key) {
            if !cached.is_stale(self.stale_time) {
                debug!(key, namespace = ?namespace, age = %cached.age_display(), "Query cache hit");
                return Ok(cached.data);
            }
        }

        let started = self.generation();
        let data = fetch().await?;

        let mut inner = self.inner.lock();
        if inner.generation == started {
            let entry: Entry = Arc::new(CachedData::new(data.clone()));
            inner.entries.insert(Self::key(namespace, key), entry);
        } else {
            debug!(key, "Cache invalidated during fetch, result not stored");
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fetch_caches_per_namespace() {
        let cache = QueryCache::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let load = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec!["a".to_string()])
        };

        cache.fetch(Some("team-a"), "namespaces", load).await.unwrap();
        cache.fetch(Some("team-a/"), "namespaces", load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.fetch(None, "namespaces", load).await.unwrap();
        cache.fetch(Some("/"), "namespaces", load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_is_not_stored() {
        let cache = QueryCache::default();
        let handle = &cache;
        let value = cache
            .fetch(None, "methods", move || async move {
                handle.invalidate_all();
                Ok::<_, ()>(1u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert!(cache.get::<u32>(None, "methods").is_none());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = QueryCache::default();
        let result: Result<u32, &str> = cache.fetch(None, "k", || async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_entries() {
        let mut cached = CachedData::new(1);
        assert!(!cached.is_stale(DEFAULT_STALE_TIME));
        cached.cached_at = Utc::now() - chrono::Duration::seconds(31);
        assert!(cached.is_stale(DEFAULT_STALE_TIME));
        assert_eq!(cached.age_display(), "31s ago");
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = QueryCache::default();
        cache.insert(Some("team-a"), "namespaces", 1u8);
        cache.insert(None, "namespaces:detail", 2u8);
        cache.insert(None, "auth-methods", 3u8);
        cache.invalidate_prefix("namespaces");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u8>(None, "auth-methods").map(|c| c.data), Some(3));
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let cache = QueryCache::default();
        cache.insert(None, "k", 1u8);
        assert!(cache.get::<String>(None, "k").is_none());
    }
}
