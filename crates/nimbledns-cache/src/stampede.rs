//! Single-flight suppression for concurrent identical misses.
//!
//! The first requester to miss on a fingerprint registers it here and goes
//! upstream; everyone else parks in `wait` until the originator calls `done`
//! (or a timeout fires) and then re-checks the cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct Flight {
    done: watch::Sender<bool>,
    dups: usize,
}

pub struct SingleFlight {
    inflight: DashMap<u64, Flight>,
    timeout: Duration,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            timeout,
        }
    }

    /// Register `key` as in progress. The first caller creates the record;
    /// later callers just bump the duplicate count.
    pub fn add(&self, key: u64) {
        match self.inflight.entry(key) {
            Entry::Occupied(mut e) => e.get_mut().dups += 1,
            Entry::Vacant(v) => {
                let (done, _) = watch::channel(false);
                v.insert(Flight { done, dups: 1 });
            }
        }
    }

    /// Park until the flight for `key` completes or the timeout elapses.
    /// Returns immediately when no flight is registered. A timed-out waiter
    /// simply resumes the normal path.
    pub async fn wait(&self, key: u64) {
        // Subscribing while the map ref is held pins the flight: `done`
        // cannot complete between the lookup and the subscription.
        let mut rx = match self.inflight.get(&key) {
            Some(flight) => flight.done.subscribe(),
            None => return,
        };
        let _ = tokio::time::timeout(self.timeout, rx.changed()).await;
    }

    /// Release one registration of `key`. The last one out completes the
    /// flight and wakes every waiter.
    pub fn done(&self, key: u64) {
        if let Entry::Occupied(mut e) = self.inflight.entry(key) {
            if e.get().dups > 1 {
                e.get_mut().dups -= 1;
                return;
            }
            let (_, flight) = e.remove_entry();
            let _ = flight.done.send(true);
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_without_flight_returns_immediately() {
        let sf = SingleFlight::new();
        sf.wait(1).await;
    }

    #[tokio::test]
    async fn test_done_wakes_waiters() {
        let sf = Arc::new(SingleFlight::new());
        sf.add(7);

        let woken = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let sf = sf.clone();
            let woken = woken.clone();
            tasks.push(tokio::spawn(async move {
                sf.wait(7).await;
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        sf.done(7);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 10);
        assert!(sf.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_adds_keep_flight_open() {
        let sf = SingleFlight::new();
        sf.add(3);
        sf.add(3);
        sf.done(3);
        assert_eq!(sf.len(), 1, "one registration still outstanding");
        sf.done(3);
        assert!(sf.is_empty());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let sf = SingleFlight::with_timeout(Duration::from_millis(20));
        sf.add(9);
        // Nobody calls done; the waiter must come back on its own.
        tokio::time::timeout(Duration::from_secs(1), sf.wait(9))
            .await
            .expect("wait returned via its own timeout");
    }

    #[tokio::test]
    async fn test_done_without_add_is_noop() {
        let sf = SingleFlight::new();
        sf.done(42);
        assert!(sf.is_empty());
    }
}
