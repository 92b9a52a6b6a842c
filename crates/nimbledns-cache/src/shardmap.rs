//! Lock-sharded `u64 -> V` map with a best-effort size bound.
//!
//! The bound is advisory: concurrent inserts may push the length past
//! `max_size` transiently, and an eviction pass then deletes randomly sampled
//! keys until the map is back under the bound. There is no per-entry LRU
//! bookkeeping.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Extra keys deleted beyond the observed overshoot, as a fraction of
/// `max_size`, so back-to-back inserts do not each trigger a pass.
const EVICT_BATCH_PCT: usize = 20;
/// Oversampling factor when picking eviction candidates.
const EVICT_SAMPLE_FACTOR: usize = 5;
/// A pass that evicts nothing breaks the loop; this caps the passes even when
/// every round makes a little progress.
const EVICT_MAX_ROUNDS: usize = 10;

pub struct ShardedMap<V> {
    shards: Box<[RwLock<HashMap<u64, V>>]>,
    mask: u64,
    len: AtomicUsize,
    max_size: usize,
}

/// Shard count for a configured capacity. Small maps get few shards so
/// `random_sample` still finds populated buckets.
fn shard_count(max_size: usize) -> usize {
    match max_size {
        0..=1_000 => 256,
        1_001..=10_000 => 1_024,
        10_001..=100_000 => 4_096,
        100_001..=500_000 => 16_384,
        _ => 65_536,
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn new(max_size: usize) -> Self {
        let count = shard_count(max_size);
        let shards = (0..count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            mask: (count - 1) as u64,
            len: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Shard index for a key. The multiply spreads sequential keys; the shift
    /// uses the better-mixed middle bits.
    fn shard(&self, key: u64) -> &RwLock<HashMap<u64, V>> {
        let h = key.wrapping_mul(0x9E37_79B9);
        &self.shards[((h >> 16) & self.mask) as usize]
    }

    pub fn get(&self, key: u64) -> Option<V> {
        self.shard(key).read().get(&key).cloned()
    }

    /// Blind write: replaces any existing value. Runs an eviction pass when
    /// the bound is exceeded and returns how many entries it evicted.
    pub fn insert(&self, key: u64, value: V) -> usize {
        let fresh = self.shard(key).write().insert(key, value).is_none();
        if fresh {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        if self.len() > self.max_size {
            self.evict()
        } else {
            0
        }
    }

    pub fn remove(&self, key: u64) -> bool {
        let removed = self.shard(key).write().remove(&key).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Eventually consistent length; may lag or lead slightly under
    /// concurrent mutation.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit entries until `f` returns false. Each shard is observed under
    /// its own lock: no key is visited twice, concurrent inserts may be
    /// skipped.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64, &V) -> bool,
    {
        for shard in self.shards.iter() {
            let guard = shard.read();
            for (k, v) in guard.iter() {
                if !f(*k, v) {
                    return;
                }
            }
        }
    }

    /// Up to `n` keys gathered from randomly chosen shards. Every shard is
    /// consulted at most once; no ordering guarantees.
    pub fn random_sample(&self, n: usize) -> Vec<u64> {
        let mut keys = Vec::with_capacity(n);
        if n == 0 {
            return keys;
        }
        let start = rand::thread_rng().gen_range(0..self.shards.len());
        for offset in 0..self.shards.len() {
            let shard = &self.shards[(start + offset) % self.shards.len()];
            for k in shard.read().keys() {
                keys.push(*k);
                if keys.len() >= n {
                    return keys;
                }
            }
        }
        keys
    }

    /// Delete randomly sampled keys until the map is back under its bound.
    /// Best-effort: admits defeat after a fruitless pass or ten rounds.
    fn evict(&self) -> usize {
        let mut total = 0;
        for _ in 0..EVICT_MAX_ROUNDS {
            let len = self.len();
            if len <= self.max_size {
                break;
            }
            let overhead = len - self.max_size;
            let batch = (overhead + self.max_size * EVICT_BATCH_PCT / 100).max(1);

            let victims = if self.max_size < 100 || batch < 10 {
                let mut keys = Vec::with_capacity(batch);
                self.for_each(|k, _| {
                    keys.push(k);
                    keys.len() < batch
                });
                keys
            } else {
                let sample = (batch * EVICT_SAMPLE_FACTOR).min((self.max_size / 5).max(1));
                self.random_sample(sample)
            };

            let mut evicted = 0;
            for key in victims {
                if self.remove(key) {
                    evicted += 1;
                    if evicted >= batch {
                        break;
                    }
                }
            }
            total += evicted;
            if evicted == 0 {
                break;
            }
        }
        total
    }
}
