//! Hybrid Tier
//!
//! Composes a memory tier and a disk tier behind one surface. Reads go
//! memory-first with a disk fallback and optional promotion back into
//! memory; writes land in memory synchronously and reach disk either
//! immediately (write-through) or through a debounced, coalescing
//! pending-writes queue (write-back).
//!
//! The hybrid keeps its own hit/miss counters instead of deriving them
//! from the inner tiers, because those can be cleared independently.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::codec::{sizer_from_codec, Codec};
use crate::disk::{DiskCache, DiskConfig};
use crate::entry::{CacheKey, SetOptions};
use crate::error::Result;
use crate::expiration::Expiration;
use crate::memory::{MemoryCache, MemoryConfig};
use crate::stats::{CacheStats, HybridStats};

/// Hybrid tier configuration
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Directory handed to the disk tier
    pub directory: PathBuf,
    /// Forwarded to the memory tier (its cleanup interval is replaced
    /// by `cleanup_interval` below)
    pub memory: MemoryConfig,
    /// Byte budget of the disk tier
    pub max_disk_bytes: u64,
    /// Write disk synchronously on every set; otherwise writes are
    /// coalesced and flushed after `flush_delay`
    pub write_to_disk_on_set: bool,
    /// Copy disk hits back into memory before returning them
    pub promote_on_disk_hit: bool,
    /// Background expiration sweep interval, shared by both tiers
    pub cleanup_interval: Option<Duration>,
    /// Debounce window for deferred disk writes
    pub flush_delay: Duration,
}

impl HybridConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            memory: MemoryConfig::default(),
            max_disk_bytes: 512 * 1024 * 1024, // 512MB
            write_to_disk_on_set: true,
            promote_on_disk_hit: true,
            cleanup_interval: None,
            flush_delay: Duration::from_millis(500),
        }
    }
}

/// Which tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from the memory tier
    Memory,
    /// Served from the disk tier
    Disk,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Memory => write!(f, "memory"),
            CacheSource::Disk => write!(f, "disk"),
        }
    }
}

/// Per-write routing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridWriteOptions {
    /// Do not write the memory tier
    pub skip_memory: bool,
    /// Do not write the disk tier
    pub skip_disk: bool,
}

struct PendingWrite<V> {
    value: V,
    expiration: Option<Expiration>,
}

type PendingMap<K, V> = Mutex<HashMap<K, PendingWrite<V>>>;

async fn drain_pending<K, V, C>(pending: &PendingMap<K, V>, disk: &DiskCache<K, V, C>) -> usize
where
    K: CacheKey,
    V: Send + Sync + 'static,
    C: Codec<Value = V>,
{
    let drained: HashMap<K, PendingWrite<V>> = std::mem::take(&mut *pending.lock().await);
    let count = drained.len();
    for (key, write) in drained {
        if let Err(e) = disk.set_with(&key, &write.value, write.expiration).await {
            warn!(key = %key, "deferred disk write failed: {e}");
        }
    }
    count
}

/// Builder for a [`HybridCache`] with a non-default clock.
pub struct HybridCacheBuilder<K, V, C> {
    config: HybridConfig,
    codec: C,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> HybridCacheBuilder<K, V, C>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    C: Codec<Value = V> + Clone,
{
    /// Substitute the time source for both tiers.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(self) -> Result<HybridCache<K, V, C>> {
        let mut memory_config = self.config.memory.clone();
        memory_config.cleanup_interval = self.config.cleanup_interval;
        let memory = MemoryCache::builder(memory_config)
            .clock(Arc::clone(&self.clock))
            .sizer(sizer_from_codec(self.codec.clone()))
            .build();

        let disk_config = DiskConfig {
            directory: self.config.directory.clone(),
            max_bytes: self.config.max_disk_bytes,
            cleanup_interval: self.config.cleanup_interval,
        };
        let disk = DiskCache::builder(disk_config, self.codec)
            .clock(self.clock)
            .build()
            .await?;

        Ok(HybridCache {
            memory,
            disk: Arc::new(disk),
            pending: Arc::new(Mutex::new(HashMap::new())),
            flush_task: parking_lot::Mutex::new(None),
            stats: parking_lot::Mutex::new(HybridStats::default()),
            config: self.config,
        })
    }
}

/// Two-tier cache: fast memory in front of persistent disk.
pub struct HybridCache<K, V, C>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    C: Codec<Value = V>,
{
    memory: MemoryCache<K, V>,
    disk: Arc<DiskCache<K, V, C>>,
    pending: Arc<PendingMap<K, V>>,
    flush_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: parking_lot::Mutex<HybridStats>,
    config: HybridConfig,
}

impl<K, V, C> HybridCache<K, V, C>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    C: Codec<Value = V> + Clone,
{
    /// Open (or create) a hybrid cache over `config.directory`.
    pub async fn new(config: HybridConfig, codec: C) -> Result<Self> {
        Self::builder(config, codec).build().await
    }

    /// Start building a hybrid cache with a custom clock.
    pub fn builder(config: HybridConfig, codec: C) -> HybridCacheBuilder<K, V, C> {
        HybridCacheBuilder {
            config,
            codec,
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        }
    }

    /// Look up a value: memory first, then disk.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_with_source(key).await.map(|(value, _)| value)
    }

    /// Same as [`get`](Self::get) but exposes which tier served the
    /// call.
    pub async fn get_with_source(&self, key: &K) -> Option<(V, CacheSource)> {
        if let Some(value) = self.memory.get(key).await {
            self.stats.lock().memory_hits += 1;
            return Some((value, CacheSource::Memory));
        }
        match self.disk.get_with_metadata(key).await {
            None => {
                self.stats.lock().misses += 1;
                None
            }
            Some((value, meta)) => {
                if self.config.promote_on_disk_hit {
                    // Carry the remaining deadline into memory so the
                    // promoted copy cannot outlive the disk record
                    let expiration = match meta.expires_at {
                        Some(deadline) => Expiration::At(deadline),
                        None => Expiration::Never,
                    };
                    if let Err(e) = self
                        .memory
                        .set_with(key.clone(), value.clone(), SetOptions::expiring(expiration))
                        .await
                    {
                        warn!("promotion to memory failed: {e}");
                    }
                }
                self.stats.lock().disk_hits += 1;
                Some((value, CacheSource::Disk))
            }
        }
    }

    /// Store a value in both tiers per the configured write mode.
    pub async fn set(&self, key: K, value: V) -> Result<()> {
        self.set_with(key, value, None, HybridWriteOptions::default())
            .await
    }

    /// Store a value with explicit expiration and routing.
    ///
    /// The memory write is synchronous and its failure propagates; a
    /// synchronous disk-write failure is logged and swallowed, leaving
    /// the memory write effective.
    pub async fn set_with(
        &self,
        key: K,
        value: V,
        expiration: Option<Expiration>,
        options: HybridWriteOptions,
    ) -> Result<()> {
        if !options.skip_memory {
            let memory_options = SetOptions {
                expiration,
                ..Default::default()
            };
            self.memory
                .set_with(key.clone(), value.clone(), memory_options)
                .await?;
        }
        if !options.skip_disk {
            if self.config.write_to_disk_on_set {
                if let Err(e) = self.disk.set_with(&key, &value, expiration).await {
                    warn!(key = %key, "disk write failed, value remains in memory: {e}");
                }
            } else {
                self.enqueue_disk_write(key, value, expiration).await;
            }
        }
        Ok(())
    }

    /// Store a value in memory now and enqueue a coalesced disk write,
    /// regardless of the configured write mode.
    pub async fn set_deferred(&self, key: K, value: V) -> Result<()> {
        self.set_deferred_with(key, value, None).await
    }

    pub async fn set_deferred_with(
        &self,
        key: K,
        value: V,
        expiration: Option<Expiration>,
    ) -> Result<()> {
        let memory_options = SetOptions {
            expiration,
            ..Default::default()
        };
        self.memory
            .set_with(key.clone(), value.clone(), memory_options)
            .await?;
        self.enqueue_disk_write(key, value, expiration).await;
        Ok(())
    }

    /// A later write to the same key replaces the earlier pending one.
    async fn enqueue_disk_write(&self, key: K, value: V, expiration: Option<Expiration>) {
        self.pending
            .lock()
            .await
            .insert(key, PendingWrite { value, expiration });
        self.arm_flush();
    }

    /// (Re)arm the single debounced flush task.
    fn arm_flush(&self) {
        let pending = Arc::clone(&self.pending);
        let disk = Arc::clone(&self.disk);
        let delay = self.config.flush_delay;
        let mut slot = self.flush_task.lock();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drain_pending(&pending, &disk).await;
        }));
    }

    /// Drain pending writes to disk now. Returns how many were written.
    pub async fn flush(&self) -> usize {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        drain_pending(&self.pending, &self.disk).await
    }

    /// Remove a key from both tiers and from the pending queue.
    pub async fn remove(&self, key: &K) -> bool {
        let pending_removed = self.pending.lock().await.remove(key).is_some();
        let memory_removed = self.memory.remove(key).await.is_some();
        let disk_removed = self.disk.remove(key).await;
        pending_removed || memory_removed || disk_removed
    }

    /// Clear both tiers and cancel pending writes.
    pub async fn remove_all(&self) -> Result<()> {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
        self.memory.remove_all().await;
        self.disk.remove_all().await
    }

    /// Warm the memory tier from disk without rewriting disk. Returns
    /// how many keys were loaded.
    pub async fn preload(&self, keys: &[K]) -> usize {
        let mut loaded = 0;
        for key in keys {
            if let Some((value, meta)) = self.disk.get_with_metadata(key).await {
                let expiration = match meta.expires_at {
                    Some(deadline) => Expiration::At(deadline),
                    None => Expiration::Never,
                };
                let options = SetOptions::expiring(expiration);
                match self.memory.set_with(key.clone(), value, options).await {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!(key = %key, "preload into memory failed: {e}"),
                }
            }
        }
        loaded
    }

    /// Presence in either tier, respecting expiration.
    pub async fn contains(&self, key: &K) -> bool {
        self.memory.contains(key).await || self.disk.contains(key).await
    }

    /// Read the memory tier only. A hit counts toward the hybrid's
    /// memory-hit statistics.
    pub async fn get_from_memory(&self, key: &K) -> Option<V> {
        let value = self.memory.get(key).await;
        if value.is_some() {
            self.stats.lock().memory_hits += 1;
        }
        value
    }

    /// Read the disk tier only. A hit counts toward the hybrid's
    /// disk-hit statistics.
    pub async fn get_from_disk(&self, key: &K) -> Option<V> {
        let value = self.disk.get(key).await;
        if value.is_some() {
            self.stats.lock().disk_hits += 1;
        }
        value
    }

    /// Clear the memory tier only.
    pub async fn clear_memory(&self) {
        self.memory.remove_all().await;
    }

    /// Clear the disk tier only.
    pub async fn clear_disk(&self) -> Result<()> {
        self.disk.remove_all().await
    }

    /// The hybrid's own hit/miss counters.
    pub fn stats(&self) -> HybridStats {
        self.stats.lock().clone()
    }

    /// Statistics of the inner memory tier.
    pub async fn memory_stats(&self) -> CacheStats {
        self.memory.stats().await
    }

    /// Statistics of the inner disk tier.
    pub async fn disk_stats(&self) -> CacheStats {
        self.disk.stats().await
    }

    /// Number of writes waiting for the next flush.
    pub async fn pending_writes(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Get a reference to the memory tier.
    pub fn memory(&self) -> &MemoryCache<K, V> {
        &self.memory
    }

    /// Get a reference to the disk tier.
    pub fn disk(&self) -> &DiskCache<K, V, C> {
        &self.disk
    }

    /// Get the configuration.
    pub fn config(&self) -> &HybridConfig {
        &self.config
    }
}

impl<K, V, C> Drop for HybridCache<K, V, C>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
    C: Codec<Value = V>,
{
    fn drop(&mut self) {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    fn user() -> User {
        User {
            id: 7,
            name: "morgan".to_string(),
        }
    }

    type UserCache = HybridCache<String, User, JsonCodec<User>>;

    async fn open(dir: &TempDir, configure: impl FnOnce(&mut HybridConfig)) -> UserCache {
        let mut config = HybridConfig::new(dir.path());
        configure(&mut config);
        HybridCache::new(config, JsonCodec::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_through_and_promotion() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        cache.set("u".to_string(), user()).await.unwrap();
        cache.clear_memory().await;
        assert_eq!(cache.get_from_memory(&"u".to_string()).await, None);

        let (value, source) = cache.get_with_source(&"u".to_string()).await.unwrap();
        assert_eq!(value, user());
        assert_eq!(source, CacheSource::Disk);

        // Promotion put it back into memory
        assert_eq!(cache.get_from_memory(&"u".to_string()).await, Some(user()));

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
    }

    #[tokio::test]
    async fn test_memory_hit_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        cache.set("u".to_string(), user()).await.unwrap();
        let (_, source) = cache.get_with_source(&"u".to_string()).await.unwrap();
        assert_eq!(source, CacheSource::Memory);
        assert_eq!(cache.disk_stats().await.hits, 0);
    }

    #[tokio::test]
    async fn test_promotion_disabled() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |c| c.promote_on_disk_hit = false).await;

        cache.set("u".to_string(), user()).await.unwrap();
        cache.clear_memory().await;

        assert_eq!(cache.get(&"u".to_string()).await, Some(user()));
        assert_eq!(cache.get_from_memory(&"u".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_miss_recorded_once() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        assert_eq!(cache.get(&"missing".to_string()).await, None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.memory_hits + stats.disk_hits, 0);
    }

    #[tokio::test]
    async fn test_skip_options() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        cache
            .set_with(
                "mem-only".to_string(),
                user(),
                None,
                HybridWriteOptions {
                    skip_disk: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cache.disk().is_empty().await);
        assert_eq!(
            cache.get_from_memory(&"mem-only".to_string()).await,
            Some(user())
        );

        cache
            .set_with(
                "disk-only".to_string(),
                user(),
                None,
                HybridWriteOptions {
                    skip_memory: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cache.get_from_memory(&"disk-only".to_string()).await, None);
        assert_eq!(
            cache.get_from_disk(&"disk-only".to_string()).await,
            Some(user())
        );
    }

    #[tokio::test]
    async fn test_deferred_writes_coalesce() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |c| {
            c.write_to_disk_on_set = false;
            c.flush_delay = Duration::from_millis(50);
        })
        .await;

        let disk_writes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let writes = Arc::clone(&disk_writes);
        cache.disk().add_observer(move |event| {
            if matches!(event.event_type(), "Added" | "Updated") {
                writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let v1 = User {
            id: 1,
            name: "first".to_string(),
        };
        let v2 = User {
            id: 2,
            name: "second".to_string(),
        };
        cache.set("k".to_string(), v1).await.unwrap();
        cache.set("k".to_string(), v2.clone()).await.unwrap();
        assert_eq!(cache.pending_writes().await, 1);
        assert!(cache.disk().is_empty().await);

        // Memory sees the newest value immediately
        assert_eq!(cache.get(&"k".to_string()).await, Some(v2.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.pending_writes().await, 0);
        assert_eq!(cache.disk().len().await, 1);
        assert_eq!(cache.get_from_disk(&"k".to_string()).await, Some(v2));
        assert_eq!(disk_writes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |c| {
            c.write_to_disk_on_set = false;
            c.flush_delay = Duration::from_secs(60);
        })
        .await;

        cache.set("a".to_string(), user()).await.unwrap();
        cache.set_deferred("b".to_string(), user()).await.unwrap();

        assert_eq!(cache.flush().await, 2);
        assert_eq!(cache.disk().len().await, 2);
        assert_eq!(cache.flush().await, 0);
    }

    #[tokio::test]
    async fn test_remove_drops_pending_write() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |c| {
            c.write_to_disk_on_set = false;
            c.flush_delay = Duration::from_millis(30);
        })
        .await;

        cache.set("k".to_string(), user()).await.unwrap();
        assert!(cache.remove(&"k".to_string()).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.disk().is_empty().await);
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_remove_all_cancels_pending() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |c| {
            c.write_to_disk_on_set = false;
            c.flush_delay = Duration::from_millis(30);
        })
        .await;

        cache.set("a".to_string(), user()).await.unwrap();
        cache.remove_all().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.disk().is_empty().await);
        assert!(cache.memory().is_empty().await);
        assert_eq!(cache.pending_writes().await, 0);
    }

    #[tokio::test]
    async fn test_preload() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        for i in 0..3 {
            let value = User {
                id: i,
                name: format!("user-{i}"),
            };
            cache.disk().set(&format!("k{i}"), &value).await.unwrap();
        }

        let keys: Vec<String> = (0..4).map(|i| format!("k{i}")).collect();
        assert_eq!(cache.preload(&keys).await, 3);
        for i in 0..3 {
            assert!(
                cache.get_from_memory(&format!("k{i}")).await.is_some(),
                "k{i} should be warm"
            );
        }
    }

    #[tokio::test]
    async fn test_contains_checks_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        cache.set("k".to_string(), user()).await.unwrap();
        assert!(cache.contains(&"k".to_string()).await);

        cache.clear_memory().await;
        assert!(cache.contains(&"k".to_string()).await);

        cache.clear_disk().await.unwrap();
        assert!(!cache.contains(&"k".to_string()).await);
    }

    #[tokio::test]
    async fn test_remove_hits_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, |_| {}).await;

        cache.set("k".to_string(), user()).await.unwrap();
        assert!(cache.remove(&"k".to_string()).await);
        assert!(!cache.remove(&"k".to_string()).await);
        assert_eq!(cache.get(&"k".to_string()).await, None);
        assert!(cache.disk().is_empty().await);
    }

    #[tokio::test]
    async fn test_state_survives_reopen_through_disk() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir, |_| {}).await;
            cache.set("k".to_string(), user()).await.unwrap();
        }

        let cache = open(&dir, |_| {}).await;
        let (value, source) = cache.get_with_source(&"k".to_string()).await.unwrap();
        assert_eq!(value, user());
        assert_eq!(source, CacheSource::Disk);
    }
}
