//! Positive and negative response stores: thin wrappers over the sharded map
//! that apply TTL bounds and treat expired hits as misses.

use crate::classify::{self, StoreKind};
use crate::entry::CacheEntry;
use crate::metrics::CacheMetrics;
use crate::shardmap::ShardedMap;
use hickory_proto::op::Message;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct TtlBounds {
    min: u32,
    max: u32,
}

impl TtlBounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min: min.min(max),
            max,
        }
    }

    pub fn clamp(&self, ttl: u32) -> u32 {
        ttl.clamp(self.min, self.max)
    }
}

pub struct ResponseStore {
    map: ShardedMap<Arc<CacheEntry>>,
    bounds: TtlBounds,
}

impl ResponseStore {
    pub fn new(capacity: usize, bounds: TtlBounds) -> Self {
        Self {
            map: ShardedMap::new(capacity),
            bounds,
        }
    }

    /// Live entry for `key`. An expired entry is removed on sight and the
    /// lookup reports a miss.
    pub fn get(&self, key: u64, now: u64) -> Option<Arc<CacheEntry>> {
        let entry = self.map.get(key)?;
        if entry.is_expired(now) {
            self.map.remove(key);
            return None;
        }
        Some(entry)
    }

    /// Returns how many entries the write evicted.
    pub fn insert(&self, key: u64, entry: CacheEntry) -> usize {
        self.map.insert(key, Arc::new(entry))
    }

    pub fn remove(&self, key: u64) -> bool {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The pair of stores plus everything needed to admit a response: shared by
/// the cache middleware's interceptor and the prefetch workers.
pub struct Stores {
    pub positive: ResponseStore,
    pub negative: ResponseStore,
    metrics: Arc<CacheMetrics>,
    rate_limit: u32,
}

impl Stores {
    pub fn new(
        capacity: usize,
        positive_bounds: TtlBounds,
        negative_bounds: TtlBounds,
        rate_limit: u32,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            positive: ResponseStore::new(capacity, positive_bounds),
            negative: ResponseStore::new(capacity, negative_bounds),
            metrics,
            rate_limit,
        }
    }

    /// Positive store first, then negative.
    pub fn lookup(&self, key: u64, now: u64) -> Option<Arc<CacheEntry>> {
        self.positive
            .get(key, now)
            .or_else(|| self.negative.get(key, now))
    }

    /// Classify a response and admit it to the right store, or drop it.
    /// Never fails: an unpackable or inadmissible response is logged and the
    /// caller's response path continues unchanged.
    pub fn store_response(&self, key: u64, res: &Message, now: u64) {
        let rt = classify::classify(res, now);
        let Some(kind) = rt.store() else {
            return;
        };
        let store = match kind {
            StoreKind::Positive => &self.positive,
            StoreKind::Negative => &self.negative,
        };
        let ttl = store.bounds.clamp(classify::compute_ttl(res, rt, now));

        match CacheEntry::from_response(res, ttl, self.rate_limit, now) {
            Ok(entry) => {
                let evicted = store.insert(key, entry);
                self.metrics.evicted(evicted as u64);
                self.metrics
                    .set_store_sizes(self.positive.len(), self.negative.len());
            }
            Err(e) => debug!(error = %e, "response refused by cache"),
        }
    }

    /// Drop `key` from both stores. Used by purge.
    pub fn remove(&self, key: u64) -> bool {
        let removed = self.positive.remove(key) | self.negative.remove(key);
        if removed {
            self.metrics
                .set_store_sizes(self.positive.len(), self.negative.len());
        }
        removed
    }
}
