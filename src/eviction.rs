//! Eviction Policies and the Eviction Index
//!
//! The index answers "which key should leave next" under a named
//! policy. It keeps its own per-key bookkeeping, fed through the
//! `on_*` notifications, so victim selection never has to reach back
//! into the entry map.
//!
//! # Design
//!
//! - LRU and FIFO share an arena-backed doubly linked list: nodes live
//!   in a `Vec`, neighbour indices live inside the nodes, and a
//!   key-to-slot map gives O(1) unlink and move-to-front. No owning
//!   cycles, no unsafe.
//! - LFU, TTL, Random, and Size build a transient candidate list per
//!   selection call. Evictions are batched, so the O(n) scan amortises.
//! - `Critical`-priority keys are never returned as victims.

use std::collections::HashMap;
use std::time::SystemTime;

use rand::seq::SliceRandom;

use crate::entry::{CacheKey, EntryMetadata, Priority};

/// Named victim-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EvictionPolicy {
    /// Least recently used leaves first
    #[default]
    Lru,
    /// Least frequently used leaves first; ties broken by oldest access
    Lfu,
    /// Insertion order; access does not reorder
    Fifo,
    /// Smallest expiration deadline leaves first; deadline-free last
    Ttl,
    /// Uniform random sample
    Random,
    /// Largest entries leave first
    Size,
}

impl EvictionPolicy {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
            EvictionPolicy::Ttl => "ttl",
            EvictionPolicy::Random => "random",
            EvictionPolicy::Size => "size",
        }
    }

    fn keeps_order_list(&self) -> bool {
        matches!(self, EvictionPolicy::Lru | EvictionPolicy::Fifo)
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Arena-backed order list
// =============================================================================

const NIL: usize = usize::MAX;

struct Node<K> {
    key: Option<K>,
    prev: usize,
    next: usize,
}

/// Doubly linked list over an arena of nodes.
///
/// Head is the most recently touched end; tail is the eviction end.
struct OrderList<K> {
    nodes: Vec<Node<K>>,
    slots: HashMap<K, usize>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
}

impl<K: CacheKey> OrderList<K> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            slots: HashMap::new(),
            head: NIL,
            tail: NIL,
            free: Vec::new(),
        }
    }

    fn push_front(&mut self, key: K) {
        debug_assert!(!self.slots.contains_key(&key));
        let node = Node {
            key: Some(key.clone()),
            prev: NIL,
            next: self.head,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
        self.slots.insert(key, slot);
    }

    fn unlink(&mut self, slot: usize) {
        let prev = self.nodes[slot].prev;
        let next = self.nodes[slot].next;
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn remove(&mut self, key: &K) {
        if let Some(slot) = self.slots.remove(key) {
            self.unlink(slot);
            self.nodes[slot].key = None;
            self.free.push(slot);
        }
    }

    fn move_to_front(&mut self, key: &K) {
        let Some(&slot) = self.slots.get(key) else {
            return;
        };
        if slot == self.head {
            return;
        }
        self.unlink(slot);
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    /// Iterate keys from the eviction end toward the head.
    fn iter_from_tail(&self) -> TailIter<'_, K> {
        TailIter {
            list: self,
            cursor: self.tail,
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

struct TailIter<'a, K> {
    list: &'a OrderList<K>,
    cursor: usize,
}

impl<'a, K> Iterator for TailIter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        if self.cursor == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cursor];
        self.cursor = node.prev;
        // Linked slots always carry a key
        node.key.as_ref()
    }
}

// =============================================================================
// Eviction index
// =============================================================================

/// Per-key bookkeeping the index needs for victim selection.
#[derive(Debug, Clone)]
struct IndexRecord {
    priority: Priority,
    size_bytes: u64,
    expires_at: Option<SystemTime>,
    last_access_at: SystemTime,
    access_count: u64,
}

impl IndexRecord {
    fn from_metadata(meta: &EntryMetadata) -> Self {
        Self {
            priority: meta.priority,
            size_bytes: meta.size_bytes,
            expires_at: meta.expires_at,
            last_access_at: meta.last_access_at,
            access_count: meta.access_count,
        }
    }
}

/// Maintains, for every live key, what a policy needs to pick a victim.
///
/// The owning tier must keep this in lockstep with its entry map: every
/// insert/access/update/remove is mirrored here, and both structures
/// always hold exactly the same key set.
pub(crate) struct EvictionIndex<K> {
    policy: EvictionPolicy,
    records: HashMap<K, IndexRecord>,
    order: OrderList<K>,
}

impl<K: CacheKey> EvictionIndex<K> {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            order: OrderList::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn on_insert(&mut self, key: K, meta: &EntryMetadata) {
        self.records
            .insert(key.clone(), IndexRecord::from_metadata(meta));
        if self.policy.keeps_order_list() {
            self.order.remove(&key);
            self.order.push_front(key);
        }
    }

    pub fn on_access(&mut self, key: &K, meta: &EntryMetadata) {
        if let Some(record) = self.records.get_mut(key) {
            *record = IndexRecord::from_metadata(meta);
        }
        // FIFO ignores accesses
        if self.policy == EvictionPolicy::Lru {
            self.order.move_to_front(key);
        }
    }

    /// Value replaced under an existing key. LRU treats this as an
    /// access; FIFO keeps the original queue position.
    pub fn on_update(&mut self, key: &K, meta: &EntryMetadata) {
        if let Some(record) = self.records.get_mut(key) {
            *record = IndexRecord::from_metadata(meta);
        }
        if self.policy == EvictionPolicy::Lru {
            self.order.move_to_front(key);
        }
    }

    pub fn on_remove(&mut self, key: &K) {
        self.records.remove(key);
        if self.policy.keeps_order_list() {
            self.order.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }

    /// Select up to `n` victims in eviction order.
    ///
    /// `Critical` keys and `exclude` are never returned. An empty
    /// result means nothing evictable remains.
    pub fn pick_victims(&self, n: usize, exclude: Option<&K>) -> Vec<K> {
        if n == 0 || self.records.is_empty() {
            return Vec::new();
        }
        let eligible = |key: &K| {
            if exclude == Some(key) {
                return false;
            }
            self.records
                .get(key)
                .map(|r| r.priority != Priority::Critical)
                .unwrap_or(false)
        };

        match self.policy {
            EvictionPolicy::Lru | EvictionPolicy::Fifo => self
                .order
                .iter_from_tail()
                .filter(|key| eligible(*key))
                .take(n)
                .cloned()
                .collect(),
            EvictionPolicy::Lfu => {
                let mut candidates: Vec<(&K, u64, SystemTime)> = self
                    .records
                    .iter()
                    .filter(|&(key, _)| eligible(key))
                    .map(|(key, r)| (key, r.access_count, r.last_access_at))
                    .collect();
                candidates.sort_by_key(|&(_, count, last_access)| (count, last_access));
                candidates.into_iter().take(n).map(|(k, _, _)| k.clone()).collect()
            }
            EvictionPolicy::Ttl => {
                let mut candidates: Vec<(&K, Option<SystemTime>)> = self
                    .records
                    .iter()
                    .filter(|&(key, _)| eligible(key))
                    .map(|(key, r)| (key, r.expires_at))
                    .collect();
                // None sorts last: deadline-free entries leave after every
                // deadline-bearing one
                candidates.sort_by_key(|&(_, expires)| (expires.is_none(), expires));
                candidates.into_iter().take(n).map(|(k, _)| k.clone()).collect()
            }
            EvictionPolicy::Size => {
                let mut candidates: Vec<(&K, u64)> = self
                    .records
                    .iter()
                    .filter(|&(key, _)| eligible(key))
                    .map(|(key, r)| (key, r.size_bytes))
                    .collect();
                candidates.sort_by_key(|&(_, size)| std::cmp::Reverse(size));
                candidates.into_iter().take(n).map(|(k, _)| k.clone()).collect()
            }
            EvictionPolicy::Random => {
                let candidates: Vec<&K> = self
                    .records
                    .keys()
                    .filter(|key| eligible(*key))
                    .collect();
                let mut rng = rand::thread_rng();
                candidates
                    .choose_multiple(&mut rng, n)
                    .map(|k| (*k).clone())
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn meta(created: u64) -> EntryMetadata {
        EntryMetadata::new(at(created), None, 100)
    }

    fn insert(index: &mut EvictionIndex<String>, key: &str, created: u64) -> EntryMetadata {
        let m = meta(created);
        index.on_insert(key.to_string(), &m);
        m
    }

    #[test]
    fn test_lru_victim_order() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lru);
        insert(&mut index, "a", 1);
        insert(&mut index, "b", 2);
        insert(&mut index, "c", 3);

        assert_eq!(index.pick_victims(1, None), vec!["a".to_string()]);

        // Touch "a": it becomes most recent, "b" is now the victim
        let mut m = meta(1);
        m.record_access(at(10));
        index.on_access(&"a".to_string(), &m);
        assert_eq!(index.pick_victims(1, None), vec!["b".to_string()]);

        assert_eq!(
            index.pick_victims(3, None),
            vec!["b".to_string(), "c".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_lru_update_moves_to_front() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lru);
        insert(&mut index, "a", 1);
        insert(&mut index, "b", 2);

        index.on_update(&"a".to_string(), &meta(5));
        assert_eq!(index.pick_victims(1, None), vec!["b".to_string()]);
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut index = EvictionIndex::new(EvictionPolicy::Fifo);
        insert(&mut index, "a", 1);
        insert(&mut index, "b", 2);

        let mut m = meta(1);
        m.record_access(at(10));
        index.on_access(&"a".to_string(), &m);
        index.on_update(&"a".to_string(), &m);

        // Still insertion order
        assert_eq!(index.pick_victims(1, None), vec!["a".to_string()]);
    }

    #[test]
    fn test_lfu_lowest_count_first() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lfu);
        let mut ma = insert(&mut index, "a", 1);
        insert(&mut index, "b", 2);

        ma.record_access(at(10));
        ma.record_access(at(11));
        index.on_access(&"a".to_string(), &ma);

        assert_eq!(index.pick_victims(1, None), vec!["b".to_string()]);
    }

    #[test]
    fn test_lfu_ties_break_by_oldest_access() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lfu);
        let mut ma = insert(&mut index, "a", 1);
        let mut mb = insert(&mut index, "b", 1);

        ma.record_access(at(20));
        index.on_access(&"a".to_string(), &ma);
        mb.record_access(at(10));
        index.on_access(&"b".to_string(), &mb);

        // Same count, "b" accessed longer ago
        assert_eq!(index.pick_victims(1, None), vec!["b".to_string()]);
    }

    #[test]
    fn test_ttl_smallest_deadline_first_none_last() {
        let mut index = EvictionIndex::new(EvictionPolicy::Ttl);

        let mut ma = meta(1);
        ma.expires_at = Some(at(100));
        index.on_insert("a".to_string(), &ma);

        let mut mb = meta(1);
        mb.expires_at = Some(at(50));
        index.on_insert("b".to_string(), &mb);

        index.on_insert("c".to_string(), &meta(1)); // no deadline

        assert_eq!(
            index.pick_victims(3, None),
            vec!["b".to_string(), "a".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_size_largest_first() {
        let mut index = EvictionIndex::new(EvictionPolicy::Size);

        let mut small = meta(1);
        small.size_bytes = 10;
        index.on_insert("small".to_string(), &small);

        let mut big = meta(1);
        big.size_bytes = 1000;
        index.on_insert("big".to_string(), &big);

        assert_eq!(index.pick_victims(1, None), vec!["big".to_string()]);
    }

    #[test]
    fn test_random_samples_without_replacement() {
        let mut index = EvictionIndex::new(EvictionPolicy::Random);
        for i in 0..10 {
            insert(&mut index, &format!("k{i}"), i);
        }

        let victims = index.pick_victims(4, None);
        assert_eq!(victims.len(), 4);
        let unique: std::collections::HashSet<_> = victims.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_critical_is_never_a_victim() {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::Fifo,
            EvictionPolicy::Ttl,
            EvictionPolicy::Random,
            EvictionPolicy::Size,
        ] {
            let mut index = EvictionIndex::new(policy);
            let mut m = meta(1);
            m.priority = Priority::Critical;
            index.on_insert("precious".to_string(), &m);
            index.on_insert("plain".to_string(), &meta(2));

            let victims = index.pick_victims(10, None);
            assert_eq!(victims, vec!["plain".to_string()], "policy {policy}");
        }
    }

    #[test]
    fn test_exclude_key() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lru);
        insert(&mut index, "a", 1);
        let exclude = "a".to_string();
        assert!(index.pick_victims(1, Some(&exclude)).is_empty());
    }

    #[test]
    fn test_remove_keeps_list_consistent() {
        let mut index = EvictionIndex::new(EvictionPolicy::Lru);
        insert(&mut index, "a", 1);
        insert(&mut index, "b", 2);
        insert(&mut index, "c", 3);

        index.on_remove(&"b".to_string());
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.pick_victims(2, None),
            vec!["a".to_string(), "c".to_string()]
        );

        // Slot reuse after removal
        insert(&mut index, "d", 4);
        assert_eq!(
            index.pick_victims(3, None),
            vec!["a".to_string(), "c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn test_clear() {
        let mut index = EvictionIndex::new(EvictionPolicy::Fifo);
        insert(&mut index, "a", 1);
        index.clear();
        assert_eq!(index.len(), 0);
        assert!(index.pick_victims(1, None).is_empty());
    }
}
