//! The caching core: can this query be answered from memory without going to
//! the network?
//!
//! [`CacheHandler`] is the middleware that answers the question. Underneath
//! it sit a lock-sharded bounded map, an entry codec working on wire bytes,
//! a response classifier, single-flight miss suppression, a prefetch worker
//! pool, and per-entry token-bucket rate limiting.

pub mod classify;
pub mod entry;
pub mod handler;
pub mod key;
pub mod metrics;
pub mod prefetch;
pub mod ratelimit;
pub mod shardmap;
pub mod stampede;
pub mod store;

pub use entry::{purge_qname, unix_now, CacheEntry};
pub use handler::CacheHandler;
pub use key::question_key;
pub use metrics::CacheStats;
