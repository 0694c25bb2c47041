//! Disk Tier
//!
//! One file per entry under a cache directory, plus a versioned
//! manifest document that is the source of truth for which files
//! belong to the cache and how many bytes they hold.
//!
//! # Layout
//!
//! ```text
//! <directory>/
//!   manifest                 (versioned JSON document)
//!   data/<sha256>.blob       (one per entry)
//!   temp/                    (transient during atomic writes)
//! ```
//!
//! Every write, data and manifest alike, goes through the same
//! temp-then-rename protocol with an fsync before the rename, so a
//! cold start over the directory sees either the old state or the new
//! complete state. Eviction is fixed to LRU by last access regardless
//! of the memory tier's policy.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::codec::Codec;
use crate::entry::CacheKey;
use crate::error::{Error, Result};
use crate::events::{CacheEvent, EvictionReason, ObserverRegistry, ObserverToken};
use crate::expiration::Expiration;
use crate::stats::CacheStats;

/// Manifest format version. Documents with a different version are
/// ignored at startup, leaving the data files for `verify_integrity`.
pub const MANIFEST_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest";
const DATA_DIR: &str = "data";
const TEMP_DIR: &str = "temp";

/// Disk tier configuration
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Directory owned by this cache
    pub directory: PathBuf,
    /// Maximum total bytes of stored entries
    pub max_bytes: u64,
    /// Interval of the background expiration sweep; `None` disables it
    pub cleanup_interval: Option<Duration>,
}

impl DiskConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_bytes: 512 * 1024 * 1024, // 512MB
            cleanup_interval: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }
}

/// One manifest record per stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Textual rendering of the key
    pub key: String,
    /// Size of the stored file in bytes
    pub size_bytes: u64,
    /// When the entry was written (reset on overwrite)
    pub created_at: SystemTime,
    /// Last successful read
    pub last_access_at: SystemTime,
    /// Number of successful reads
    pub access_count: u64,
    /// Absolute expiration deadline, if any
    pub expires_at: Option<SystemTime>,
}

impl FileMetadata {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: HashMap<String, FileMetadata>,
}

impl Manifest {
    fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: HashMap::new(),
        }
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.size_bytes).sum()
    }
}

/// Filename for a key's textual rendering: full SHA-256 hex digest.
fn blob_name(key_string: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_string.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}.blob")
}

/// Write `bytes` to `temp`, fsync, then atomically rename onto `dest`.
async fn write_atomic(temp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(temp, dest).await?;
    Ok(())
}

struct DiskInner {
    manifest: Manifest,
    bytes: u64,
    stats: CacheStats,
    temp_seq: u64,
}

struct DiskShared<C> {
    inner: Mutex<DiskInner>,
    config: DiskConfig,
    codec: C,
    clock: Arc<dyn Clock>,
    observers: ObserverRegistry<String>,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    manifest_path: PathBuf,
}

impl<C> DiskShared<C>
where
    C: Codec,
{
    fn blob_path(&self, key_string: &str) -> PathBuf {
        self.data_dir.join(blob_name(key_string))
    }

    fn next_temp_path(&self, inner: &mut DiskInner, label: &str) -> PathBuf {
        let seq = inner.temp_seq;
        inner.temp_seq += 1;
        self.temp_dir.join(format!("{label}-{seq}.tmp"))
    }

    async fn persist_manifest(&self, inner: &mut DiskInner) -> Result<()> {
        let bytes = serde_json::to_vec(&inner.manifest).map_err(Error::encode)?;
        let temp = self.next_temp_path(inner, "manifest");
        write_atomic(&temp, &self.manifest_path, &bytes).await
    }

    fn drop_record(&self, inner: &mut DiskInner, key_string: &str) -> Option<FileMetadata> {
        let record = inner.manifest.entries.remove(key_string)?;
        inner.bytes = inner.bytes.saturating_sub(record.size_bytes);
        Some(record)
    }

    /// Remove every expired record and its file. Shared by the public
    /// sweep and the background task.
    async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            let expired: Vec<String> = inner
                .manifest
                .entries
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key_string in &expired {
                self.drop_record(&mut inner, key_string);
                let _ = tokio::fs::remove_file(self.blob_path(key_string)).await;
                inner.stats.expirations += 1;
                events.push(CacheEvent::expired(key_string.clone()));
            }
            if !expired.is_empty() {
                if let Err(e) = self.persist_manifest(&mut inner).await {
                    warn!("failed to persist manifest after sweep: {e}");
                    events.push(CacheEvent::error(format!("manifest persist failed: {e}")));
                }
            }
            expired.len()
        };
        for event in &events {
            self.observers.emit(event);
        }
        removed
    }
}

/// Builder for a [`DiskCache`] with a non-default clock.
pub struct DiskCacheBuilder<K, V, C> {
    config: DiskConfig,
    codec: C,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> DiskCacheBuilder<K, V, C>
where
    K: CacheKey,
    V: Send + Sync + 'static,
    C: Codec<Value = V>,
{
    /// Substitute the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create directories, load the manifest, and start the cleanup
    /// task if configured.
    pub async fn build(self) -> Result<DiskCache<K, V, C>> {
        let root = self.config.directory.clone();
        let data_dir = root.join(DATA_DIR);
        let temp_dir = root.join(TEMP_DIR);
        let manifest_path = root.join(MANIFEST_FILE);

        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&temp_dir).await?;

        // Leftover temp files from an interrupted run are garbage
        if let Ok(mut dir) = tokio::fs::read_dir(&temp_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }

        let manifest = load_manifest(&manifest_path).await;
        let bytes = manifest.total_bytes();
        debug!(
            entries = manifest.entries.len(),
            bytes, "disk cache loaded"
        );

        let shared = Arc::new(DiskShared {
            inner: Mutex::new(DiskInner {
                manifest,
                bytes,
                stats: CacheStats::default(),
                temp_seq: 0,
            }),
            config: self.config,
            codec: self.codec,
            clock: self.clock,
            observers: ObserverRegistry::new(),
            data_dir,
            temp_dir,
            manifest_path,
        });

        let cleanup = shared.config.cleanup_interval.map(|interval| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let removed = shared.purge_expired().await;
                    if removed > 0 {
                        info!(removed, "disk expiration sweep removed entries");
                    }
                }
            })
        });

        Ok(DiskCache {
            shared,
            cleanup,
            _marker: PhantomData,
        })
    }
}

async fn load_manifest(path: &Path) -> Manifest {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Manifest::empty(),
        Err(e) => {
            warn!("failed to read manifest, starting empty: {e}");
            return Manifest::empty();
        }
    };
    match serde_json::from_slice::<Manifest>(&bytes) {
        Ok(manifest) if manifest.version == MANIFEST_VERSION => manifest,
        Ok(manifest) => {
            warn!(
                found = manifest.version,
                expected = MANIFEST_VERSION,
                "manifest version mismatch, starting empty"
            );
            Manifest::empty()
        }
        Err(e) => {
            warn!("undecodable manifest, starting empty: {e}");
            Manifest::empty()
        }
    }
}

/// Size-bounded on-disk cache with a persisted manifest.
///
/// Observers receive events keyed by the textual rendering of the key,
/// since background sweeps only know that rendering.
pub struct DiskCache<K, V, C>
where
    C: Codec,
{
    shared: Arc<DiskShared<C>>,
    cleanup: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> DiskCache<K, V, C>
where
    K: CacheKey,
    V: Send + Sync + 'static,
    C: Codec<Value = V>,
{
    /// Open (or create) a disk cache over `config.directory`.
    pub async fn new(config: DiskConfig, codec: C) -> Result<Self> {
        Self::builder(config, codec).build().await
    }

    /// Start building a disk cache with a custom clock.
    pub fn builder(config: DiskConfig, codec: C) -> DiskCacheBuilder<K, V, C> {
        DiskCacheBuilder {
            config,
            codec,
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        }
    }

    /// Look up a value.
    ///
    /// Expired records are removed. An unreadable file is a plain miss
    /// (the record stays for `verify_integrity` to reconcile); a file
    /// that reads but fails to decode is removed together with its
    /// record and reported as an integrity eviction.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_with_metadata(key).await.map(|(value, _)| value)
    }

    /// Same as [`get`](Self::get) but also returns a snapshot of the
    /// manifest record, taken after the access was counted.
    pub async fn get_with_metadata(&self, key: &K) -> Option<(V, FileMetadata)> {
        let now = self.shared.clock.now();
        let key_string = key.to_string();
        let mut events = Vec::new();

        enum Gate {
            Miss,
            Expired,
            Live,
        }

        let result = {
            let mut inner = self.shared.inner.lock().await;
            let gate = match inner.manifest.entries.get(&key_string) {
                None => Gate::Miss,
                Some(record) if record.is_expired(now) => Gate::Expired,
                Some(_) => Gate::Live,
            };
            match gate {
                Gate::Miss => {
                    inner.stats.misses += 1;
                    None
                }
                Gate::Expired => {
                    self.shared.drop_record(&mut inner, &key_string);
                    let _ = tokio::fs::remove_file(self.shared.blob_path(&key_string)).await;
                    inner.stats.expirations += 1;
                    inner.stats.misses += 1;
                    if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                        warn!("failed to persist manifest after expiry: {e}");
                    }
                    events.push(CacheEvent::expired(key_string.clone()));
                    None
                }
                Gate::Live => {
                    let path = self.shared.blob_path(&key_string);
                    match tokio::fs::read(&path).await {
                        Err(e) => {
                            warn!(key = %key_string, "failed to read cache file: {e}");
                            inner.stats.misses += 1;
                            None
                        }
                        Ok(bytes) => match self.shared.codec.decode(&bytes) {
                            Err(e) => {
                                warn!(key = %key_string, "decode failed, removing entry: {e}");
                                self.shared.drop_record(&mut inner, &key_string);
                                let _ = tokio::fs::remove_file(&path).await;
                                inner.stats.evictions += 1;
                                inner.stats.misses += 1;
                                if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                                    warn!("failed to persist manifest after repair: {e}");
                                }
                                events.push(CacheEvent::evicted(
                                    key_string.clone(),
                                    EvictionReason::Integrity,
                                ));
                                None
                            }
                            Ok(value) => {
                                inner.stats.hits += 1;
                                inner.manifest.entries.get_mut(&key_string).map(|record| {
                                    record.last_access_at = now;
                                    record.access_count += 1;
                                    (value, record.clone())
                                })
                            }
                        },
                    }
                }
            }
        };

        for event in &events {
            self.shared.observers.emit(event);
        }
        result
    }

    /// Store a value without an expiration deadline.
    pub async fn set(&self, key: &K, value: &V) -> Result<()> {
        self.set_with(key, value, None).await
    }

    /// Store a value, evicting least-recently-accessed entries first if
    /// the byte budget would be exceeded.
    pub async fn set_with(
        &self,
        key: &K,
        value: &V,
        expiration: Option<Expiration>,
    ) -> Result<()> {
        let now = self.shared.clock.now();
        let key_string = key.to_string();
        let encoded = self.shared.codec.encode(value)?;
        let size = encoded.len() as u64;
        if size > self.shared.config.max_bytes {
            return Err(Error::CapacityExceeded);
        }
        let mut events = Vec::new();

        let result = {
            let mut inner = self.shared.inner.lock().await;
            let old_size = inner
                .manifest
                .entries
                .get(&key_string)
                .map(|r| r.size_bytes)
                .unwrap_or(0);

            // Evict to fit: least recent last_access leaves first
            while inner.bytes - old_size + size > self.shared.config.max_bytes {
                let victim = inner
                    .manifest
                    .entries
                    .iter()
                    .filter(|(candidate, _)| **candidate != key_string)
                    .min_by_key(|(_, record)| record.last_access_at)
                    .map(|(candidate, _)| candidate.clone());
                let Some(victim) = victim else { break };
                self.shared.drop_record(&mut inner, &victim);
                let _ = tokio::fs::remove_file(self.shared.blob_path(&victim)).await;
                inner.stats.evictions += 1;
                events.push(CacheEvent::evicted(victim, EvictionReason::ByteLimit));
            }

            let temp = self.shared.next_temp_path(&mut inner, "write");
            let dest = self.shared.blob_path(&key_string);
            match write_atomic(&temp, &dest, &encoded).await {
                Err(e) => Err(e),
                Ok(()) => {
                    let expires_at = expiration
                        .unwrap_or(Expiration::Never)
                        .deadline(now);
                    let replaced = inner
                        .manifest
                        .entries
                        .insert(
                            key_string.clone(),
                            FileMetadata {
                                key: key_string.clone(),
                                size_bytes: size,
                                created_at: now,
                                last_access_at: now,
                                access_count: 0,
                                expires_at,
                            },
                        )
                        .is_some();
                    inner.bytes = inner.bytes - old_size + size;
                    match self.shared.persist_manifest(&mut inner).await {
                        Err(e) => Err(e),
                        Ok(()) => {
                            events.push(if replaced {
                                CacheEvent::updated(key_string.clone())
                            } else {
                                CacheEvent::added(key_string.clone())
                            });
                            Ok(())
                        }
                    }
                }
            }
        };

        for event in &events {
            self.shared.observers.emit(event);
        }
        result
    }

    /// Remove an entry and its file. Returns false when absent.
    pub async fn remove(&self, key: &K) -> bool {
        let key_string = key.to_string();
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.shared.inner.lock().await;
            match self.shared.drop_record(&mut inner, &key_string) {
                None => false,
                Some(_) => {
                    let _ = tokio::fs::remove_file(self.shared.blob_path(&key_string)).await;
                    if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                        warn!("failed to persist manifest after remove: {e}");
                    }
                    events.push(CacheEvent::removed(key_string.clone()));
                    true
                }
            }
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        removed
    }

    /// Delete the whole data directory and start empty.
    pub async fn remove_all(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock().await;
            let _ = tokio::fs::remove_dir_all(&self.shared.data_dir).await;
            tokio::fs::create_dir_all(&self.shared.data_dir).await?;
            inner.manifest.entries.clear();
            inner.bytes = 0;
            self.shared.persist_manifest(&mut inner).await?;
        }
        self.shared.observers.emit(&CacheEvent::cleared());
        Ok(())
    }

    /// Manifest-only presence check that respects expiration.
    pub async fn contains(&self, key: &K) -> bool {
        let now = self.shared.clock.now();
        let key_string = key.to_string();
        let mut events = Vec::new();
        let present = {
            let mut inner = self.shared.inner.lock().await;
            let expired = inner
                .manifest
                .entries
                .get(&key_string)
                .map(|record| record.is_expired(now));
            match expired {
                None => false,
                Some(true) => {
                    self.shared.drop_record(&mut inner, &key_string);
                    let _ = tokio::fs::remove_file(self.shared.blob_path(&key_string)).await;
                    inner.stats.expirations += 1;
                    if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                        warn!("failed to persist manifest after expiry: {e}");
                    }
                    events.push(CacheEvent::expired(key_string.clone()));
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

    /// Remove every expired record and its file. Returns the count.
    pub async fn remove_expired(&self) -> usize {
        self.shared.purge_expired().await
    }

    /// Reconcile the manifest with the filesystem.
    ///
    /// Records whose file is missing or whose byte count diverges are
    /// removed (an integrity eviction each); files under `data/` that
    /// no record references are deleted. Returns the number of
    /// removals.
    pub async fn verify_integrity(&self) -> usize {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.shared.inner.lock().await;
            let mut removed = 0;

            let mut divergent = Vec::new();
            for (key_string, record) in &inner.manifest.entries {
                let path = self.shared.blob_path(key_string);
                let matches = matches!(
                    tokio::fs::metadata(&path).await,
                    Ok(meta) if meta.len() == record.size_bytes
                );
                if !matches {
                    divergent.push(key_string.clone());
                }
            }
            for key_string in &divergent {
                self.shared.drop_record(&mut inner, key_string);
                let _ = tokio::fs::remove_file(self.shared.blob_path(key_string)).await;
                inner.stats.evictions += 1;
                removed += 1;
                events.push(CacheEvent::evicted(
                    key_string.clone(),
                    EvictionReason::Integrity,
                ));
            }

            let expected: HashSet<String> = inner
                .manifest
                .entries
                .keys()
                .map(|key_string| blob_name(key_string))
                .collect();
            match tokio::fs::read_dir(&self.shared.data_dir).await {
                Ok(mut dir) => loop {
                    match dir.next_entry().await {
                        Ok(Some(entry)) => {
                            let name = entry.file_name().to_string_lossy().into_owned();
                            if !expected.contains(&name) {
                                let _ = tokio::fs::remove_file(entry.path()).await;
                                removed += 1;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("failed to scan data directory: {e}");
                            break;
                        }
                    }
                },
                Err(e) => warn!("failed to open data directory: {e}"),
            }

            if removed > 0 {
                if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                    warn!("failed to persist manifest after integrity pass: {e}");
                    events.push(CacheEvent::error(format!("manifest persist failed: {e}")));
                }
            }
            removed
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        removed
    }

    /// Sum of actual file sizes under `data/`, as a cross-check against
    /// the manifest total.
    pub async fn compute_disk_usage(&self) -> Result<u64> {
        // Hold the lock so the scan cannot race a concurrent write
        let _inner = self.shared.inner.lock().await;
        let mut total = 0;
        let mut dir = tokio::fs::read_dir(&self.shared.data_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }

    /// Evict approximately `percentage` percent of records, least
    /// recently accessed first. Returns the eviction count.
    pub async fn evict_percentage(&self, percentage: f64) -> usize {
        let percentage = percentage.clamp(0.0, 100.0);
        let mut events = Vec::new();
        let count = {
            let mut inner = self.shared.inner.lock().await;
            let target =
                ((inner.manifest.entries.len() as f64) * percentage / 100.0).ceil() as usize;
            let mut candidates: Vec<(String, SystemTime)> = inner
                .manifest
                .entries
                .iter()
                .map(|(key_string, record)| (key_string.clone(), record.last_access_at))
                .collect();
            candidates.sort_by_key(|&(_, last_access)| last_access);
            let victims: Vec<String> = candidates
                .into_iter()
                .take(target)
                .map(|(key_string, _)| key_string)
                .collect();
            for victim in &victims {
                self.shared.drop_record(&mut inner, victim);
                let _ = tokio::fs::remove_file(self.shared.blob_path(victim)).await;
                inner.stats.evictions += 1;
                events.push(CacheEvent::evicted(victim.clone(), EvictionReason::Pressure));
            }
            if !victims.is_empty() {
                if let Err(e) = self.shared.persist_manifest(&mut inner).await {
                    warn!("failed to persist manifest after eviction: {e}");
                }
            }
            victims.len()
        };
        for event in &events {
            self.shared.observers.emit(event);
        }
        count
    }

    /// Current entry count.
    pub async fn len(&self) -> usize {
        self.shared.inner.lock().await.manifest.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current manifest byte total.
    pub async fn total_bytes(&self) -> u64 {
        self.shared.inner.lock().await.bytes
    }

    /// Get a statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.items = inner.manifest.entries.len() as u64;
        stats.bytes = inner.bytes;
        stats
    }

    /// Get the configuration.
    pub fn config(&self) -> &DiskConfig {
        &self.shared.config
    }

    /// Register an event observer. Events carry the textual rendering
    /// of keys. Observers must not call back into this cache.
    pub fn add_observer(
        &self,
        observer: impl Fn(&CacheEvent<String>) + Send + Sync + 'static,
    ) -> ObserverToken {
        self.shared.observers.register(observer)
    }

    /// Unregister a previously added observer.
    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        self.shared.observers.unregister(token)
    }
}

impl<K, V, C> Drop for DiskCache<K, V, C>
where
    C: Codec,
{
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}
