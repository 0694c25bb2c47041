//! Cache Statistics
//!
//! Plain counters confined to each cache's serialised interior; callers
//! receive snapshots by value. Cross-cache aggregation is the caller's
//! job.

use serde::Serialize;

/// Counters maintained by a single tier.
///
/// `hits`, `misses`, `evictions`, and `expirations` only ever grow;
/// `items` and `bytes` track current state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Successful reads
    pub hits: u64,
    /// Reads that found nothing (including expired entries)
    pub misses: u64,
    /// Entries removed to restore a budget or repair state
    pub evictions: u64,
    /// Entries removed because they went stale
    pub expirations: u64,
    /// Current entry count
    pub items: u64,
    /// Current total byte estimate
    pub bytes: u64,
}

impl CacheStats {
    /// Hit ratio in `[0.0, 1.0]`; zero when nothing was read yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters maintained by the hybrid tier itself.
///
/// Kept separate from the inner tiers' counters because those can be
/// cleared independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HybridStats {
    /// Reads served from the memory tier
    pub memory_hits: u64,
    /// Reads served from the disk tier
    pub disk_hits: u64,
    /// Reads that found nothing in either tier
    pub misses: u64,
}

impl HybridStats {
    /// Hit ratio across both tiers.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        assert_eq!(HybridStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_hybrid_hit_rate_counts_both_tiers() {
        let stats = HybridStats {
            memory_hits: 2,
            disk_hits: 2,
            misses: 1,
        };
        assert_eq!(stats.hit_rate(), 0.8);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CacheStats {
            hits: 1,
            misses: 2,
            evictions: 3,
            expirations: 4,
            items: 5,
            bytes: 6,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"evictions\":3"));
    }
}
