//! Cache counters, kept twice: atomics for the admin stats endpoint and the
//! `metrics` facade for whatever recorder the embedding process installs.

use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    prefetches: AtomicU64,
    prefetch_drops: AtomicU64,
}

impl CacheMetrics {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!("nimbledns_cache_hits_total").increment(1);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("nimbledns_cache_misses_total").increment(1);
    }

    pub fn evicted(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.evictions.fetch_add(n, Ordering::Relaxed);
        counter!("nimbledns_cache_evictions_total").increment(n);
    }

    pub fn prefetched(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        counter!("nimbledns_cache_prefetches_total").increment(1);
    }

    pub fn prefetch_dropped(&self) {
        self.prefetch_drops.fetch_add(1, Ordering::Relaxed);
        counter!("nimbledns_cache_prefetch_drops_total").increment(1);
    }

    pub fn set_store_sizes(&self, positive: usize, negative: usize) {
        gauge!("nimbledns_cache_positive_size").set(positive as f64);
        gauge!("nimbledns_cache_negative_size").set(negative as f64);
    }

    pub fn snapshot(&self, positive_size: usize, negative_size: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            prefetch_drops: self.prefetch_drops.load(Ordering::Relaxed),
            positive_size,
            negative_size,
        }
    }
}

/// Point-in-time counters served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub prefetches: u64,
    pub prefetch_drops: u64,
    pub positive_size: usize,
    pub negative_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_hit_rate() {
        let m = CacheMetrics::default();
        m.hit();
        m.hit();
        m.hit();
        m.miss();
        let snap = m.snapshot(10, 2);
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert!((snap.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(snap.positive_size, 10);
    }

    #[test]
    fn test_empty_snapshot() {
        let m = CacheMetrics::default();
        let snap = m.snapshot(0, 0);
        assert_eq!(snap.hit_rate, 0.0);
    }
}
