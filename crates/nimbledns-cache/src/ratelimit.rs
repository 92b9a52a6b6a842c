//! Per-entry token buckets.
//!
//! A cached response configured with rate `r` is served at most `r` times per
//! second with bursts up to `r`. Buckets are shared through a process-wide
//! directory keyed by the rate value; within a rate, fingerprints hash into a
//! fixed set of 997 slots. Token state is fixed-point (micro-tokens) and
//! entirely atomic; stale slots are reclaimed by a periodic sweep.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Prime slot count for even fingerprint distribution.
const SLOTS: u64 = 997;
/// Fixed-point scale: one token is a million micro-tokens.
const SCALE: u64 = 1_000_000;
const MICROS_PER_SEC: u64 = 1_000_000;
/// Slots untouched this long are reclaimed.
pub const IDLE_RECLAIM: Duration = Duration::from_secs(30 * 60);

/// Microsecond clock; swappable so tests can run on virtual time.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    })
}

struct Bucket {
    tokens: AtomicU64,
    last_refill_us: AtomicU64,
    last_seen_us: AtomicU64,
}

pub struct RateLimiter {
    rate: u32,
    slots: DashMap<u64, Bucket>,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        Self::with_clock(rate, system_clock())
    }

    pub fn with_clock(rate: u32, clock: Clock) -> Self {
        Self {
            rate,
            slots: DashMap::new(),
            clock,
        }
    }

    /// Take one token from the slot `key` hashes to. A zero rate never
    /// limits.
    pub fn allow(&self, key: u64) -> bool {
        if self.rate == 0 {
            return true;
        }
        let now = (self.clock)();
        let capacity = self.rate as u64 * SCALE;
        let slot = self.slots.entry(key % SLOTS).or_insert_with(|| Bucket {
            tokens: AtomicU64::new(capacity),
            last_refill_us: AtomicU64::new(now),
            last_seen_us: AtomicU64::new(now),
        });
        slot.last_seen_us.store(now, Ordering::Release);
        self.refill(&slot, now, capacity);
        self.try_consume(&slot)
    }

    fn refill(&self, bucket: &Bucket, now: u64, capacity: u64) {
        // Claim the [last_refill, now] interval with a CAS so two refillers
        // never credit the same elapsed time twice.
        let mut last = bucket.last_refill_us.load(Ordering::Acquire);
        loop {
            if now <= last {
                return;
            }
            match bucket.last_refill_us.compare_exchange(
                last,
                now,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(next) => last = next,
            }
        }

        let elapsed = now - last;
        // rate tokens/sec in micro-tokens over elapsed micros.
        let add = ((elapsed as u128 * self.rate as u128 * SCALE as u128)
            / MICROS_PER_SEC as u128) as u64;
        if add == 0 {
            return;
        }

        let mut current = bucket.tokens.load(Ordering::Relaxed);
        loop {
            let updated = current.saturating_add(add).min(capacity);
            match bucket.tokens.compare_exchange(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(next) => current = next,
            }
        }
    }

    fn try_consume(&self, bucket: &Bucket) -> bool {
        let mut current = bucket.tokens.load(Ordering::Relaxed);
        loop {
            if current < SCALE {
                return false;
            }
            match bucket.tokens.compare_exchange(
                current,
                current - SCALE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(next) => current = next,
            }
        }
    }

    /// Drop slots idle longer than `idle`.
    fn sweep(&self, now: u64, idle: Duration) {
        let idle_us = idle.as_micros() as u64;
        self.slots
            .retain(|_, b| now.saturating_sub(b.last_seen_us.load(Ordering::Acquire)) <= idle_us);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Process-wide directory of limiters, one per live rate value. Entries whose
/// every slot has gone idle disappear after a sweep.
pub struct RateLimiterPool {
    limiters: DashMap<u32, Arc<RateLimiter>>,
    clock: Clock,
}

impl Default for RateLimiterPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterPool {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            limiters: DashMap::new(),
            clock,
        }
    }

    /// The shared limiter for `rate`; `None` when the rate is 0 (unlimited).
    pub fn get(&self, rate: u32) -> Option<Arc<RateLimiter>> {
        if rate == 0 {
            return None;
        }
        Some(
            self.limiters
                .entry(rate)
                .or_insert_with(|| Arc::new(RateLimiter::with_clock(rate, self.clock.clone())))
                .clone(),
        )
    }

    /// Reclaim idle bucket slots, then drop limiters left empty.
    pub fn sweep(&self) {
        let now = (self.clock)();
        for limiter in self.limiters.iter() {
            limiter.sweep(now, IDLE_RECLAIM);
        }
        self.limiters.retain(|_, l| !l.slots.is_empty());
    }
}
