//! Expiration Model
//!
//! An [`Expiration`] describes when an entry goes stale; it is resolved
//! to an absolute deadline once, at set time. [`ExpirationPolicy`]
//! predicates extend the model beyond wall-clock deadlines: they observe
//! the whole metadata snapshot and are consulted on every read and on
//! bulk purge sweeps.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::entry::EntryMetadata;

/// When an entry should be considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Never expires
    Never,
    /// Expires a fixed duration after the set
    After(Duration),
    /// Expires at an absolute instant
    At(SystemTime),
}

impl Expiration {
    /// Resolve to an absolute deadline relative to `now`.
    ///
    /// `Never` yields no deadline.
    pub fn deadline(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            Expiration::Never => None,
            Expiration::After(duration) => Some(now + *duration),
            Expiration::At(instant) => Some(*instant),
        }
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Expiration::Never
    }
}

/// Which timestamp an age-based policy measures from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeBasis {
    /// Age since the entry was created
    Created,
    /// Age since the entry was last read
    LastAccess,
}

/// A pure predicate over an entry's metadata snapshot.
///
/// Policies must not hold references into the cache; they see a copy of
/// the metadata and the current instant, nothing else.
pub trait ExpirationPolicy: Send + Sync {
    /// True when the entry should be treated as expired at `now`.
    fn should_expire(&self, metadata: &EntryMetadata, now: SystemTime) -> bool;
}

/// Expire entries older than a fixed age.
#[derive(Debug, Clone)]
pub struct MaxAge {
    limit: Duration,
    basis: AgeBasis,
}

impl MaxAge {
    /// Age measured from creation.
    pub fn since_creation(limit: Duration) -> Self {
        Self {
            limit,
            basis: AgeBasis::Created,
        }
    }

    /// Age measured from the last read.
    pub fn since_last_access(limit: Duration) -> Self {
        Self {
            limit,
            basis: AgeBasis::LastAccess,
        }
    }
}

impl ExpirationPolicy for MaxAge {
    fn should_expire(&self, metadata: &EntryMetadata, now: SystemTime) -> bool {
        let reference = match self.basis {
            AgeBasis::Created => metadata.created_at,
            AgeBasis::LastAccess => metadata.last_access_at,
        };
        match now.duration_since(reference) {
            Ok(age) => age >= self.limit,
            Err(_) => false,
        }
    }
}

/// Expire entries once they have been read `limit` times.
#[derive(Debug, Clone)]
pub struct MaxAccessCount {
    limit: u64,
}

impl MaxAccessCount {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl ExpirationPolicy for MaxAccessCount {
    fn should_expire(&self, metadata: &EntryMetadata, _now: SystemTime) -> bool {
        metadata.access_count >= self.limit
    }
}

/// Expire entries larger than a byte threshold.
#[derive(Debug, Clone)]
pub struct MaxSize {
    limit_bytes: u64,
}

impl MaxSize {
    pub fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes }
    }
}

impl ExpirationPolicy for MaxSize {
    fn should_expire(&self, metadata: &EntryMetadata, _now: SystemTime) -> bool {
        metadata.size_bytes > self.limit_bytes
    }
}

/// Expire entries idle for a window, with an optional hard lifetime cap.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    idle: Duration,
    max_lifetime: Option<Duration>,
}

impl SlidingWindow {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            max_lifetime: None,
        }
    }

    /// Additionally expire once total lifetime exceeds `max_lifetime`,
    /// regardless of access recency.
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = Some(max_lifetime);
        self
    }
}

impl ExpirationPolicy for SlidingWindow {
    fn should_expire(&self, metadata: &EntryMetadata, now: SystemTime) -> bool {
        if let Ok(idle) = now.duration_since(metadata.last_access_at) {
            if idle >= self.idle {
                return true;
            }
        }
        if let Some(max_lifetime) = self.max_lifetime {
            if let Ok(age) = now.duration_since(metadata.created_at) {
                return age >= max_lifetime;
            }
        }
        false
    }
}

/// Expire entries tagged with any retired tag.
#[derive(Debug, Clone, Default)]
pub struct RetiredTags {
    retired: HashSet<String>,
}

impl RetiredTags {
    pub fn new(retired: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            retired: retired.into_iter().map(Into::into).collect(),
        }
    }
}

impl ExpirationPolicy for RetiredTags {
    fn should_expire(&self, metadata: &EntryMetadata, _now: SystemTime) -> bool {
        !self.retired.is_disjoint(&metadata.tags)
    }
}

/// How a composite folds its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Expired when any child policy says so
    Any,
    /// Expired only when every child policy says so
    All,
}

/// OR/AND fold over a set of policies.
pub struct CompositePolicy {
    mode: CompositeMode,
    policies: Vec<Arc<dyn ExpirationPolicy>>,
}

impl CompositePolicy {
    pub fn new(mode: CompositeMode, policies: Vec<Arc<dyn ExpirationPolicy>>) -> Self {
        Self { mode, policies }
    }

    pub fn any(policies: Vec<Arc<dyn ExpirationPolicy>>) -> Self {
        Self::new(CompositeMode::Any, policies)
    }

    pub fn all(policies: Vec<Arc<dyn ExpirationPolicy>>) -> Self {
        Self::new(CompositeMode::All, policies)
    }
}

impl ExpirationPolicy for CompositePolicy {
    fn should_expire(&self, metadata: &EntryMetadata, now: SystemTime) -> bool {
        match self.mode {
            CompositeMode::Any => self
                .policies
                .iter()
                .any(|p| p.should_expire(metadata, now)),
            CompositeMode::All => {
                !self.policies.is_empty()
                    && self.policies.iter().all(|p| p.should_expire(metadata, now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn meta_at(created: u64) -> EntryMetadata {
        EntryMetadata::new(at(created), None, 128)
    }

    #[test]
    fn test_deadline_resolution() {
        let now = at(1000);
        assert_eq!(Expiration::Never.deadline(now), None);
        assert_eq!(
            Expiration::After(Duration::from_secs(30)).deadline(now),
            Some(at(1030))
        );
        assert_eq!(Expiration::At(at(2000)).deadline(now), Some(at(2000)));
    }

    #[test]
    fn test_max_age_since_creation() {
        let policy = MaxAge::since_creation(Duration::from_secs(60));
        let meta = meta_at(1000);
        assert!(!policy.should_expire(&meta, at(1059)));
        assert!(policy.should_expire(&meta, at(1060)));
    }

    #[test]
    fn test_max_age_since_last_access() {
        let policy = MaxAge::since_last_access(Duration::from_secs(60));
        let mut meta = meta_at(1000);
        meta.record_access(at(1100));
        assert!(!policy.should_expire(&meta, at(1150)));
        assert!(policy.should_expire(&meta, at(1160)));
    }

    #[test]
    fn test_max_access_count() {
        let policy = MaxAccessCount::new(3);
        let mut meta = meta_at(1000);
        assert!(!policy.should_expire(&meta, at(1000)));
        for _ in 0..3 {
            meta.record_access(at(1001));
        }
        assert!(policy.should_expire(&meta, at(1001)));
    }

    #[test]
    fn test_max_size() {
        let policy = MaxSize::new(100);
        let meta = meta_at(1000); // 128 bytes
        assert!(policy.should_expire(&meta, at(1000)));

        let policy = MaxSize::new(128);
        assert!(!policy.should_expire(&meta, at(1000)));
    }

    #[test]
    fn test_sliding_window_idle() {
        let policy = SlidingWindow::new(Duration::from_secs(30));
        let mut meta = meta_at(1000);
        assert!(policy.should_expire(&meta, at(1030)));

        meta.record_access(at(1025));
        assert!(!policy.should_expire(&meta, at(1030)));
    }

    #[test]
    fn test_sliding_window_max_lifetime() {
        let policy =
            SlidingWindow::new(Duration::from_secs(30)).with_max_lifetime(Duration::from_secs(100));
        let mut meta = meta_at(1000);

        // Kept alive by accesses, but the lifetime cap still fires
        meta.record_access(at(1090));
        assert!(!policy.should_expire(&meta, at(1099)));
        assert!(policy.should_expire(&meta, at(1100)));
    }

    #[test]
    fn test_retired_tags() {
        let policy = RetiredTags::new(["v1", "deprecated"]);
        let mut meta = meta_at(1000);
        assert!(!policy.should_expire(&meta, at(1000)));

        meta.tags.insert("v1".to_string());
        assert!(policy.should_expire(&meta, at(1000)));
    }

    #[test]
    fn test_composite_any_all() {
        let never: Arc<dyn ExpirationPolicy> = Arc::new(MaxAccessCount::new(u64::MAX));
        let always: Arc<dyn ExpirationPolicy> = Arc::new(MaxAccessCount::new(0));
        let meta = meta_at(1000);

        let any = CompositePolicy::any(vec![never.clone(), always.clone()]);
        assert!(any.should_expire(&meta, at(1000)));

        let all = CompositePolicy::all(vec![never, always]);
        assert!(!all.should_expire(&meta, at(1000)));
    }

    #[test]
    fn test_composite_empty() {
        let meta = meta_at(1000);
        assert!(!CompositePolicy::any(vec![]).should_expire(&meta, at(1000)));
        assert!(!CompositePolicy::all(vec![]).should_expire(&meta, at(1000)));
    }
}
