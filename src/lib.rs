//! StrataCache - Tiered In-Process Caching Engine
//!
//! A uniform key/value store across three composable storage tiers:
//! a bounded in-memory tier, a size-bounded on-disk tier, and a hybrid
//! that composes the two.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         Hybrid Cache                              │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  Memory Tier                    │  Disk Tier                      │
//! │  ┌───────────────────────────┐  │  ┌───────────────────────────┐  │
//! │  │ entry map + eviction      │  │  │ manifest + one file per   │  │
//! │  │ index (LRU/LFU/FIFO/...)  │  │  │ entry, temp-then-rename   │  │
//! │  │ count + byte budgets      │  │  │ byte budget, LRU eviction │  │
//! │  └───────────────────────────┘  │  └───────────────────────────┘  │
//! │        │  memory-first reads, disk fallback, promotion  │         │
//! │        └──────────────┬─────────────────────────────────┘         │
//! │                       │                                           │
//! │     write-through or debounced, coalescing write-back             │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each cache is an actor-like object: interior state sits behind one
//! async mutex, so operations take effect in the order they are
//! awaited, and background sweeps are tasks the cache owns and aborts
//! on drop.
//!
//! # Example
//!
//! ```
//! use stratacache::{MemoryCache, MemoryConfig};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cache: MemoryCache<String, u32> = MemoryCache::new(MemoryConfig::default());
//! cache.set("answer".to_string(), 42).await.unwrap();
//! assert_eq!(cache.get(&"answer".to_string()).await, Some(42));
//! # });
//! ```
//!
//! # Modules
//!
//! - [`clock`] - substitutable time source
//! - [`codec`] - byte codecs: JSON, binary, compressed, chained
//! - [`disk`] - size-bounded on-disk tier with a persisted manifest
//! - [`entry`] - key bounds, priorities, entry metadata
//! - [`error`] - error types
//! - [`events`] - event hook and observer registry
//! - [`eviction`] - eviction policies and the eviction index
//! - [`expiration`] - expiration descriptor and policy predicates
//! - [`hybrid`] - two-tier coordinator
//! - [`memory`] - bounded in-memory tier
//! - [`stats`] - per-tier statistics counters
//! - [`weak`] - weak-reference cache variant

pub mod clock;
pub mod codec;
pub mod disk;
pub mod entry;
pub mod error;
pub mod events;
pub mod eviction;
pub mod expiration;
pub mod hybrid;
pub mod memory;
pub mod stats;
pub mod weak;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{BincodeCodec, ChainedCodec, Codec, CompressedCodec, JsonCodec};
pub use disk::{DiskCache, DiskConfig, FileMetadata};
pub use entry::{CacheKey, EntryMetadata, Priority, SetOptions};
pub use error::{Error, Result};
pub use events::{CacheEvent, EvictionReason, ObserverToken};
pub use eviction::EvictionPolicy;
pub use expiration::{Expiration, ExpirationPolicy};
pub use hybrid::{CacheSource, HybridCache, HybridConfig, HybridWriteOptions};
pub use memory::{MemoryCache, MemoryConfig};
pub use stats::{CacheStats, HybridStats};
pub use weak::{WeakCache, WeakConfig};
