//! Cache Entry Types
//!
//! Key bounds, per-entry priorities, and the metadata snapshot every
//! tier maintains alongside a stored value.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::time::SystemTime;

use crate::expiration::Expiration;

/// Bounds required of a cache key.
///
/// `Display` supplies the textual rendering the disk tier hashes into a
/// filename; equality and hashing drive the in-memory maps. Implemented
/// automatically for every type meeting the bounds.
pub trait CacheKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Per-entry eviction priority.
///
/// `Critical` entries are never selected by automatic eviction; the
/// lower levels only order ties today but leave room for pressure-level
/// policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// First to go under pressure
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Preferentially retained
    High,
    /// Exempt from automatic eviction
    Critical,
}

/// Metadata tracked for every live entry.
///
/// Returned to callers as a snapshot by `get_with_metadata`; also the
/// input to expiration-policy predicates.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    /// When the entry was created (reset on overwrite)
    pub created_at: SystemTime,
    /// Last successful read
    pub last_access_at: SystemTime,
    /// Number of successful reads
    pub access_count: u64,
    /// Absolute expiration deadline, if any
    pub expires_at: Option<SystemTime>,
    /// Best-effort size estimate in bytes
    pub size_bytes: u64,
    /// Eviction priority
    pub priority: Priority,
    /// Caller-supplied tags, consulted by tag-based expiration policies
    pub tags: HashSet<String>,
}

impl EntryMetadata {
    /// Fresh metadata for an entry born at `now`.
    pub fn new(now: SystemTime, expires_at: Option<SystemTime>, size_bytes: u64) -> Self {
        Self {
            created_at: now,
            last_access_at: now,
            access_count: 0,
            expires_at,
            size_bytes,
            priority: Priority::Normal,
            tags: HashSet::new(),
        }
    }

    /// Whether the entry's deadline has passed at `now`.
    #[inline]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Record a successful read at `now`.
    #[inline]
    pub(crate) fn record_access(&mut self, now: SystemTime) {
        self.last_access_at = now;
        self.access_count += 1;
    }
}

/// Options accepted by the memory tier's `set_with`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Expiration for this entry; falls back to the cache's default
    pub expiration: Option<Expiration>,
    /// Eviction priority
    pub priority: Priority,
    /// Explicit byte cost; when absent the cache's sizer is consulted
    pub cost: Option<u64>,
    /// Tags consulted by tag-based expiration policies
    pub tags: HashSet<String>,
}

impl SetOptions {
    /// Options carrying only an expiration.
    pub fn expiring(expiration: Expiration) -> Self {
        Self {
            expiration: Some(expiration),
            ..Self::default()
        }
    }

    /// Options carrying only a priority.
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}
