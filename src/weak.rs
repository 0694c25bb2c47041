//! Weak-Reference Cache Variant
//!
//! Entries hold non-owning handles to externally owned values; "the
//! referenced object is still alive" replaces expiration. A read of a
//! dead handle removes it, and `compact` sweeps the rest. Not one of
//! the three storage tiers - values here have reference semantics by
//! construction.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::entry::CacheKey;
use crate::stats::CacheStats;

/// Weak cache configuration
#[derive(Debug, Clone, Default)]
pub struct WeakConfig {
    /// Interval of the background dead-handle sweep; `None` disables it
    pub compact_interval: Option<Duration>,
}

struct WeakInner<K, V> {
    entries: HashMap<K, Weak<V>>,
    stats: CacheStats,
}

struct WeakShared<K, V> {
    inner: Mutex<WeakInner<K, V>>,
}

impl<K: CacheKey, V: Send + Sync + 'static> WeakShared<K, V> {
    /// Drop every handle whose referent has been destroyed.
    async fn compact(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, handle| handle.strong_count() > 0);
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        removed
    }
}

/// Cache of non-owning handles to externally owned values.
pub struct WeakCache<K: CacheKey, V: Send + Sync + 'static> {
    shared: Arc<WeakShared<K, V>>,
    compaction: Option<JoinHandle<()>>,
}

impl<K: CacheKey, V: Send + Sync + 'static> WeakCache<K, V> {
    /// Create a weak cache. Must run inside a Tokio runtime when
    /// `compact_interval` is configured.
    pub fn new(config: WeakConfig) -> Self {
        let shared = Arc::new(WeakShared {
            inner: Mutex::new(WeakInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
        });

        let compaction = config.compact_interval.map(|interval| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let removed = shared.compact().await;
                    if removed > 0 {
                        debug!(removed, "compacted dead cache handles");
                    }
                }
            })
        });

        Self { shared, compaction }
    }

    /// Store a non-owning handle to `value`.
    pub async fn set(&self, key: K, value: &Arc<V>) {
        let mut inner = self.shared.inner.lock().await;
        inner.entries.insert(key, Arc::downgrade(value));
    }

    /// Upgrade the stored handle. A dead handle is removed and the
    /// read reported as a miss.
    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.shared.inner.lock().await;
        match inner.entries.get(key).map(Weak::upgrade) {
            None => {
                inner.stats.misses += 1;
                None
            }
            Some(None) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            Some(Some(value)) => {
                inner.stats.hits += 1;
                Some(value)
            }
        }
    }

    /// Whether a live handle exists under `key`; removes a dead one.
    pub async fn contains(&self, key: &K) -> bool {
        let mut inner = self.shared.inner.lock().await;
        match inner.entries.get(key).map(|handle| handle.strong_count() > 0) {
            None => false,
            Some(false) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                false
            }
            Some(true) => true,
        }
    }

    /// Remove a handle regardless of liveness.
    pub async fn remove(&self, key: &K) -> bool {
        self.shared.inner.lock().await.entries.remove(key).is_some()
    }

    /// Remove every handle.
    pub async fn remove_all(&self) {
        self.shared.inner.lock().await.entries.clear();
    }

    /// Drop dead handles now. Returns the removal count.
    pub async fn compact(&self) -> usize {
        self.shared.compact().await
    }

    /// Number of stored handles, dead ones included until compaction.
    pub async fn len(&self) -> usize {
        self.shared.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get a statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.items = inner.entries.len() as u64;
        stats
    }
}

impl<K: CacheKey, V: Send + Sync + 'static> Drop for WeakCache<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.compaction.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_handle_roundtrip() {
        let cache: WeakCache<String, String> = WeakCache::new(WeakConfig::default());
        let value = Arc::new("shared".to_string());

        cache.set("k".to_string(), &value).await;
        let fetched = cache.get(&"k".to_string()).await.unwrap();
        assert_eq!(*fetched, "shared");
        assert!(Arc::ptr_eq(&fetched, &value));
    }

    #[tokio::test]
    async fn test_dead_handle_reads_absent() {
        let cache: WeakCache<String, String> = WeakCache::new(WeakConfig::default());
        let value = Arc::new("transient".to_string());
        cache.set("k".to_string(), &value).await;
        drop(value);

        assert_eq!(cache.get(&"k".to_string()).await, None);
        // The dead handle was removed on read
        assert_eq!(cache.len().await, 0);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_contains_liveness() {
        let cache: WeakCache<String, u32> = WeakCache::new(WeakConfig::default());
        let value = Arc::new(1u32);
        cache.set("k".to_string(), &value).await;

        assert!(cache.contains(&"k".to_string()).await);
        drop(value);
        assert!(!cache.contains(&"k".to_string()).await);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_compact_sweeps_dead_handles() {
        let cache: WeakCache<String, u32> = WeakCache::new(WeakConfig::default());
        let keeper = Arc::new(0u32);
        cache.set("live".to_string(), &keeper).await;
        for i in 0..5 {
            let transient = Arc::new(i);
            cache.set(format!("dead{i}"), &transient).await;
        }

        assert_eq!(cache.len().await, 6);
        assert_eq!(cache.compact().await, 5);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&"live".to_string()).await.is_some());
    }

    #[tokio::test]
    async fn test_background_compaction() {
        let cache: WeakCache<String, u32> = WeakCache::new(WeakConfig {
            compact_interval: Some(Duration::from_millis(20)),
        });
        let transient = Arc::new(9u32);
        cache.set("k".to_string(), &transient).await;
        drop(transient);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_and_remove_all() {
        let cache: WeakCache<String, u32> = WeakCache::new(WeakConfig::default());
        let value = Arc::new(1u32);
        cache.set("a".to_string(), &value).await;
        cache.set("b".to_string(), &value).await;

        assert!(cache.remove(&"a".to_string()).await);
        assert!(!cache.remove(&"a".to_string()).await);

        cache.remove_all().await;
        assert!(cache.is_empty().await);
    }
}
