//! Cache Events
//!
//! Every mutating operation emits at most one event. Delivery is
//! fire-and-forget: observers run after the state mutation and must not
//! call back into the cache that notified them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Why an entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The entry-count budget was exceeded
    Capacity,
    /// The byte budget was exceeded
    ByteLimit,
    /// The stored bytes diverged from their metadata
    Integrity,
    /// A caller requested percentage eviction
    Pressure,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::ByteLimit => "byte-limit",
            EvictionReason::Integrity => "integrity",
            EvictionReason::Pressure => "pressure",
        };
        write!(f, "{name}")
    }
}

/// A significant occurrence inside a cache.
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    /// A new entry was stored
    Added { key: K, timestamp: DateTime<Utc> },
    /// An existing entry was overwritten
    Updated { key: K, timestamp: DateTime<Utc> },
    /// An entry was explicitly removed
    Removed { key: K, timestamp: DateTime<Utc> },
    /// An entry was removed to restore a budget or repair state
    Evicted {
        key: K,
        reason: EvictionReason,
        timestamp: DateTime<Utc>,
    },
    /// An entry was removed because it went stale
    Expired { key: K, timestamp: DateTime<Utc> },
    /// The whole cache was cleared
    Cleared { timestamp: DateTime<Utc> },
    /// A background operation failed
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl<K> CacheEvent<K> {
    pub fn added(key: K) -> Self {
        CacheEvent::Added {
            key,
            timestamp: Utc::now(),
        }
    }

    pub fn updated(key: K) -> Self {
        CacheEvent::Updated {
            key,
            timestamp: Utc::now(),
        }
    }

    pub fn removed(key: K) -> Self {
        CacheEvent::Removed {
            key,
            timestamp: Utc::now(),
        }
    }

    pub fn evicted(key: K, reason: EvictionReason) -> Self {
        CacheEvent::Evicted {
            key,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn expired(key: K) -> Self {
        CacheEvent::Expired {
            key,
            timestamp: Utc::now(),
        }
    }

    pub fn cleared() -> Self {
        CacheEvent::Cleared {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CacheEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Added { .. } => "Added",
            CacheEvent::Updated { .. } => "Updated",
            CacheEvent::Removed { .. } => "Removed",
            CacheEvent::Evicted { .. } => "Evicted",
            CacheEvent::Expired { .. } => "Expired",
            CacheEvent::Cleared { .. } => "Cleared",
            CacheEvent::Error { .. } => "Error",
        }
    }

    /// Get the subject key if the event concerns a single entry.
    pub fn key(&self) -> Option<&K> {
        match self {
            CacheEvent::Added { key, .. }
            | CacheEvent::Updated { key, .. }
            | CacheEvent::Removed { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::Expired { key, .. } => Some(key),
            CacheEvent::Cleared { .. } | CacheEvent::Error { .. } => None,
        }
    }
}

/// Handle identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type ObserverFn<K> = Arc<dyn Fn(&CacheEvent<K>) + Send + Sync>;

/// Registry of event observers for one cache instance.
pub struct ObserverRegistry<K> {
    observers: RwLock<Vec<(u64, ObserverFn<K>)>>,
    next_token: AtomicU64,
}

impl<K> Default for ObserverRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ObserverRegistry<K> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register an observer; the returned token unregisters it.
    pub fn register(&self, observer: impl Fn(&CacheEvent<K>) + Send + Sync + 'static) -> ObserverToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((token, Arc::new(observer)));
        ObserverToken(token)
    }

    /// Unregister; returns false when the token was already gone.
    pub fn unregister(&self, token: ObserverToken) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != token.0);
        observers.len() != before
    }

    /// Deliver an event to every registered observer.
    pub fn emit(&self, event: &CacheEvent<K>) {
        let observers: Vec<ObserverFn<K>> = self
            .observers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_event_types() {
        assert_eq!(CacheEvent::added("k").event_type(), "Added");
        assert_eq!(
            CacheEvent::evicted("k", EvictionReason::Capacity).event_type(),
            "Evicted"
        );
        assert_eq!(CacheEvent::<String>::cleared().event_type(), "Cleared");
    }

    #[test]
    fn test_event_key() {
        assert_eq!(CacheEvent::removed("k").key(), Some(&"k"));
        assert_eq!(CacheEvent::<&str>::cleared().key(), None);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(EvictionReason::Capacity.to_string(), "capacity");
        assert_eq!(EvictionReason::ByteLimit.to_string(), "byte-limit");
        assert_eq!(EvictionReason::Integrity.to_string(), "integrity");
    }

    #[test]
    fn test_register_and_emit() {
        let registry = ObserverRegistry::<String>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let token = registry.register(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&CacheEvent::added("a".to_string()));
        registry.emit(&CacheEvent::removed("a".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(registry.unregister(token));
        registry.emit(&CacheEvent::cleared());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // Unregistering twice is a no-op
        assert!(!registry.unregister(token));
    }

    #[test]
    fn test_multiple_observers() {
        let registry = ObserverRegistry::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            registry.register(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.len(), 3);

        registry.emit(&CacheEvent::added(1));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
