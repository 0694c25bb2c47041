//! Memory Tier
//!
//! A bounded key-value map coupled with an eviction index. Budgets on
//! both entry count and total bytes are enforced on every write by
//! evicting policy-selected victims; stale entries are removed lazily
//! on access and in bulk by an optional background sweep.
//!
//! All state lives behind one async mutex, so operations on a single
//! cache take effect in the order they are awaited.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::entry::{CacheKey, EntryMetadata, SetOptions};
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EvictionReason, ObserverRegistry, ObserverToken};
use crate::eviction::{EvictionIndex, EvictionPolicy};
use crate::expiration::{Expiration, ExpirationPolicy};
use crate::stats::CacheStats;

/// Byte-cost estimator consulted when a `set` carries no explicit cost.
pub type Sizer<V> = Arc<dyn Fn(&V) -> Result<u64> + Send + Sync>;

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub max_items: usize,
    /// Maximum total byte estimate
    pub max_bytes: u64,
    /// Victim-selection policy
    pub eviction_policy: EvictionPolicy,
    /// Expiration applied when a `set` does not name one
    pub default_expiration: Expiration,
    /// Interval of the background expiration sweep; `None` disables it
    pub cleanup_interval: Option<Duration>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 256 * 1024 * 1024, // 256MB
            eviction_policy: EvictionPolicy::default(),
            default_expiration: Expiration::Never,
            cleanup_interval: None,
        }
    }
}

struct StoredEntry<V> {
    value: V,
    meta: EntryMetadata,
}

struct MemoryInner<K, V> {
    entries: HashMap<K, StoredEntry<V>>,
    index: EvictionIndex<K>,
    bytes: u64,
    stats: CacheStats,
}

struct MemoryShared<K, V> {
    inner: Mutex<MemoryInner<K, V>>,
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    observers: ObserverRegistry<K>,
    policies: Vec<Arc<dyn ExpirationPolicy>>,
    sizer: Option<Sizer<V>>,
}

impl<K: CacheKey, V: Clone + Send + Sync + 'static> MemoryShared<K, V> {
    fn entry_is_stale(&self, meta: &EntryMetadata, now: SystemTime) -> bool {
        meta.is_expired(now) || self.policies.iter().any(|p| p.should_expire(meta, now))
    }

    /// Remove every stale entry; the bulk counterpart of lazy expiry.
    async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            let stale: Vec<K> = inner
                .entries
                .iter()
                .filter(|(_, entry)| self.entry_is_stale(&entry.meta, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                remove_entry(&mut inner, key);
                inner.stats.expirations += 1;
                events.push(CacheEvent::expired(key.clone()));
            }
            stale.len()
        };
        for event in &events {
            self.observers.emit(event);
        }
        removed
    }
}

fn remove_entry<K: CacheKey, V>(
    inner: &mut MemoryInner<K, V>,
    key: &K,
) -> Option<StoredEntry<V>> {
    let entry = inner.entries.remove(key)?;
    inner.index.on_remove(key);
    inner.bytes = inner.bytes.saturating_sub(entry.meta.size_bytes);
    // Map and index always hold the same key set
    debug_assert_eq!(inner.index.len(), inner.entries.len());
    Some(entry)
}

/// Builder for a [`MemoryCache`] with a non-default clock, expiration
/// policies, or byte sizer.
pub struct MemoryCacheBuilder<K, V> {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    policies: Vec<Arc<dyn ExpirationPolicy>>,
    sizer: Option<Sizer<V>>,
    _marker: PhantomData<fn() -> K>,
}

impl<K: CacheKey, V: Clone + Send + Sync + 'static> MemoryCacheBuilder<K, V> {
    /// Substitute the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an expiration-policy predicate, consulted on every read
    /// and on bulk sweeps.
    pub fn expiration_policy(mut self, policy: impl ExpirationPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    /// Install a byte-cost estimator for sets without an explicit cost.
    pub fn sizer(mut self, sizer: Sizer<V>) -> Self {
        self.sizer = Some(sizer);
        self
    }

    /// Build the cache. Must run inside a Tokio runtime when
    /// `cleanup_interval` is configured.
    pub fn build(self) -> MemoryCache<K, V> {
        let shared = Arc::new(MemoryShared {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                index: EvictionIndex::new(self.config.eviction_policy),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            config: self.config,
            clock: self.clock,
            observers: ObserverRegistry::new(),
            policies: self.policies,
            sizer: self.sizer,
        });

        let cleanup = shared.config.cleanup_interval.map(|interval| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let removed = shared.purge_expired().await;
                    if removed > 0 {
                        info!(removed, "expiration sweep removed entries");
                    } else {
                        debug!("expiration sweep found nothing to remove");
                    }
                }
            })
        });

        MemoryCache { shared, cleanup }
    }
}

/// Bounded in-memory cache with pluggable eviction and expiration.
pub struct MemoryCache<K: CacheKey, V: Clone + Send + Sync + 'static> {
    shared: Arc<MemoryShared<K, V>>,
    cleanup: Option<JoinHandle<()>>,
}

impl<K: CacheKey, V: Clone + Send + Sync + 'static> MemoryCache<K, V> {
    /// Create a cache with the given configuration.
    pub fn new(config: MemoryConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building a cache with a custom clock, policies, or sizer.
    pub fn builder(config: MemoryConfig) -> MemoryCacheBuilder<K, V> {
        MemoryCacheBuilder {
            config,
            clock: Arc::new(SystemClock),
            policies: Vec::new(),
            sizer: None,
            _marker: PhantomData,
        }
    }

    /// Look up a value. Touches access metadata on hit; removes the
    /// entry and reports an expiration when it is stale.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_with_metadata(key).await.map(|(value, _)| value)
    }

    /// Same as [`get`](Self::get) but also returns a metadata snapshot.
    pub async fn get_with_metadata(&self, key: &K) -> Option<(V, EntryMetadata)> {
        let now = self.shared.clock.now();
        let mut events = Vec::new();

        enum Lookup<V> {
            Miss,
            Stale,
            Hit(V, EntryMetadata),
        }

        let result = {
            let mut inner = self.shared.inner.lock().await;
            let lookup = match inner.entries.get_mut(key) {
                None => Lookup::Miss,
                Some(entry) => {
                    if self.shared.entry_is_stale(&entry.meta, now) {
                        Lookup::Stale
                    } else {
                        entry.meta.record_access(now);
                        Lookup::Hit(entry.value.clone(), entry.meta.clone())
                    }
                }
            };
            match lookup {
                Lookup::Miss => {
                    inner.stats.misses += 1;
                    None
                }
                Lookup::Stale => {
                    remove_entry(&mut inner, key);
                    inner.stats.expirations += 1;
                    inner.stats.misses += 1;
                    events.push(CacheEvent::expired(key.clone()));
                    None
                }
                Lookup::Hit(value, meta) => {
                    inner.index.on_access(key, &meta);
                    inner.stats.hits += 1;
                    Some((value, meta))
                }
            }
        };

        for event in &events {
            self.shared.observers.emit(event);
        }
        result
    }

    /// Store a value under the cache's default expiration and priority.
    pub async fn set(&self, key: K, value: V) -> Result<()> {
        self.set_with(key, value, SetOptions::default()).await
    }

    /// Store a value, evicting victims first if either budget would be
    /// exceeded.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the index cannot
    /// yield another victim (everything left is `Critical`) and the
    /// budgets still do not fit. Evictions performed before the failure
    /// stand.
    pub async fn set_with(&self, key: K, value: V, options: SetOptions) -> Result<()> {
        let now = self.shared.clock.now();
        let cost = match options.cost {
            Some(cost) => cost,
            None => match &self.shared.sizer {
                Some(sizer) => sizer(&value)?,
                None => 0,
            },
        };
        let mut events = Vec::new();

        let result = {
            let mut inner = self.shared.inner.lock().await;

            let fit: Result<()> = loop {
                let replacing = inner.entries.get(&key).map(|e| e.meta.size_bytes);
                let items_after = inner.entries.len() + usize::from(replacing.is_none());
                let bytes_after = inner.bytes - replacing.unwrap_or(0) + cost;

                let reason = if items_after > self.shared.config.max_items {
                    EvictionReason::Capacity
                } else if bytes_after > self.shared.config.max_bytes {
                    EvictionReason::ByteLimit
                } else {
                    break Ok(());
                };

                let Some(victim) = inner.index.pick_victims(1, Some(&key)).pop() else {
                    break Err(Error::CapacityExceeded);
                };
                remove_entry(&mut inner, &victim);
                inner.stats.evictions += 1;
                events.push(CacheEvent::evicted(victim, reason));
            };

            if fit.is_ok() {
                let expiration = options
                    .expiration
                    .unwrap_or(self.shared.config.default_expiration);
                let mut meta = EntryMetadata::new(now, expiration.deadline(now), cost);
                meta.priority = options.priority;
                meta.tags = options.tags;

                match inner.entries.get(&key).map(|e| e.meta.size_bytes) {
                    Some(old_size) => {
                        if let Some(entry) = inner.entries.get_mut(&key) {
                            entry.value = value;
                            entry.meta = meta.clone();
                        }
                        inner.bytes = inner.bytes - old_size + cost;
                        inner.index.on_update(&key, &meta);
                        events.push(CacheEvent::updated(key.clone()));
                    }
                    None => {
                        inner.entries.insert(
                            key.clone(),
                            StoredEntry {
                                value,
                                meta: meta.clone(),
                            },
                        );
                        inner.bytes += cost;
                        inner.index.on_insert(key.clone(), &meta);
                        events.push(CacheEvent::added(key.clone()));
                    }
                }
            }
            fit
        };

        for event in &events {
            self.shared.observers.emit(event);
        }
        result
    }

    /// Return the cached value or insert the result of `init`.
    pub async fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> Result<V> {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = init();
        self.set(key, value.clone()).await?;
        Ok(value)
    }

    /// Remove an entry, returning its value.
    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut events = Vec::new();
        let value = {
            let mut inner = self.shared.inner.lock().await;
            remove_entry(&mut inner, key).map(|entry| {
                events.push(CacheEvent::removed(key.clone()));
                entry.value
            })
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        value
    }

    /// Remove every entry.
    pub async fn remove_all(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.entries.clear();
            inner.index.clear();
            inner.bytes = 0;
        }
        self.shared.observers.emit(&CacheEvent::cleared());
    }

    /// Presence check that respects expiration without touching access
    /// metadata.
    pub async fn contains(&self, key: &K) -> bool {
        let now = self.shared.clock.now();
        let mut events = Vec::new();
        let present = {
            let mut inner = self.shared.inner.lock().await;
            let stale = inner
                .entries
                .get(key)
                .map(|entry| self.shared.entry_is_stale(&entry.meta, now));
            match stale {
                None => false,
                Some(true) => {
                    remove_entry(&mut inner, key);
                    inner.stats.expirations += 1;
                    events.push(CacheEvent::expired(key.clone()));
                    false
                }
                Some(false) => true,
            }
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        present
    }

    /// Sweep all entries, removing stale ones. Returns the removal
    /// count.
    pub async fn remove_expired(&self) -> usize {
        self.shared.purge_expired().await
    }

    /// Evict approximately `percentage` percent of entries, chosen by
    /// the configured policy. Returns the eviction count.
    pub async fn evict_percentage(&self, percentage: f64) -> usize {
        let percentage = percentage.clamp(0.0, 100.0);
        let mut events = Vec::new();
        let count = {
            let mut inner = self.shared.inner.lock().await;
            let target = ((inner.entries.len() as f64) * percentage / 100.0).ceil() as usize;
            let victims = inner.index.pick_victims(target, None);
            for victim in &victims {
                remove_entry(&mut inner, victim);
                inner.stats.evictions += 1;
                events.push(CacheEvent::evicted(victim.clone(), EvictionReason::Pressure));
            }
            victims.len()
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        count
    }

    /// Replace the expiration of an existing entry. Returns false when
    /// the key is absent.
    pub async fn update_expiration(&self, key: &K, expiration: Expiration) -> bool {
        let now = self.shared.clock.now();
        let mut inner = self.shared.inner.lock().await;
        let meta = match inner.entries.get_mut(key) {
            None => return false,
            Some(entry) => {
                entry.meta.expires_at = expiration.deadline(now);
                entry.meta.clone()
            }
        };
        inner.index.on_update(key, &meta);
        true
    }

    /// Current entry count.
    pub async fn len(&self) -> usize {
        self.shared.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current total byte estimate.
    pub async fn total_bytes(&self) -> u64 {
        self.shared.inner.lock().await.bytes
    }

    /// Get a statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.items = inner.entries.len() as u64;
        stats.bytes = inner.bytes;
        stats
    }

    /// Get the configured eviction policy.
    pub fn policy(&self) -> EvictionPolicy {
        self.shared.config.eviction_policy
    }

    /// Get the configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.shared.config
    }

    /// Register an event observer. Observers must not call back into
    /// this cache.
    pub fn add_observer(
        &self,
        observer: impl Fn(&CacheEvent<K>) + Send + Sync + 'static,
    ) -> ObserverToken {
        self.shared.observers.register(observer)
    }

    /// Unregister a previously added observer.
    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        self.shared.observers.unregister(token)
    }
}

impl<K: CacheKey, V: Clone + Send + Sync + 'static> Drop for MemoryCache<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}
