//! The cache middleware: serves hits from the stores, deduplicates
//! concurrent misses, and intercepts the outgoing response on the miss path
//! to admit it.

use crate::entry::{parse_purge_qname, unix_now};
use crate::key::question_key;
use crate::metrics::{CacheMetrics, CacheStats};
use crate::prefetch::{PrefetchQueue, PrefetchRequest};
use crate::ratelimit::RateLimiterPool;
use crate::stampede::SingleFlight;
use crate::store::{Stores, TtlBounds};
use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use nimbledns_core::chain::{Chain, Exchanger, Handler, ResponseWriter, SinkWriter};
use nimbledns_core::config::CacheConfig;
use nimbledns_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PREFETCH_WORKERS: usize = 4;
const PREFETCH_QUEUE_CAPACITY: usize = 512;
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Longest CNAME chain completed from cache on a hit.
const CNAME_CHAIN_MAX: usize = 5;

pub struct CacheHandler {
    stores: Arc<Stores>,
    stampede: SingleFlight,
    queue: Arc<PrefetchQueue>,
    limits: Arc<RateLimiterPool>,
    metrics: Arc<CacheMetrics>,
    prefetch_pct: u32,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheHandler {
    pub fn new(cfg: &CacheConfig) -> Self {
        let prefetch_pct = if cfg.prefetch > 90 {
            warn!(
                value = cfg.prefetch,
                "prefetch threshold above 90 refused; prefetching disabled"
            );
            0
        } else {
            cfg.prefetch
        };

        let metrics = Arc::new(CacheMetrics::default());
        let stores = Arc::new(Stores::new(
            cfg.size,
            TtlBounds::new(cfg.min_ttl, cfg.max_ttl),
            TtlBounds::new(1, cfg.expire.max(1)),
            cfg.rate_limit,
            metrics.clone(),
        ));
        let queue = Arc::new(PrefetchQueue::new(PREFETCH_QUEUE_CAPACITY, metrics.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            stores,
            stampede: SingleFlight::new(),
            queue,
            limits: Arc::new(RateLimiterPool::new()),
            metrics,
            prefetch_pct,
            shutdown,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background machinery: prefetch workers resolving through
    /// `resolver`, and the rate-limiter sweeper. Called once after the
    /// handler chain is assembled.
    pub fn start(&self, resolver: Arc<dyn Exchanger>) {
        self.queue.start(
            PREFETCH_WORKERS,
            resolver,
            self.stores.clone(),
            self.shutdown.subscribe(),
        );

        let limits = self.limits.clone();
        let mut shutdown = self.shutdown.subscribe();
        *self.sweeper.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(LIMITER_SWEEP_INTERVAL) => limits.sweep(),
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Signal shutdown and join the workers.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.queue.stop().await;
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics
            .snapshot(self.stores.positive.len(), self.stores.negative.len())
    }

    /// Evict `(qname, qtype)` under both CD variants.
    pub fn purge(&self, name: &Name, qtype: RecordType) -> bool {
        let mut removed = false;
        for cd in [false, true] {
            let key = question_key(name, qtype, DNSClass::IN, cd);
            if self.stores.remove(key) {
                debug!(%name, %qtype, cd, "purged cache entry");
                removed = true;
            }
        }
        removed
    }

    /// Serve a hit, or a synthetic reply the cache owes the client without
    /// consulting upstream. Returns false when the miss path should run.
    fn try_serve(&self, chain: &mut Chain, q: &Query, key: u64, now: u64) -> bool {
        let Some(entry) = self.stores.lookup(key, now) else {
            return false;
        };

        // EDNS version negotiation happens before the stored bytes are
        // touched.
        if let Some(edns) = chain.request.edns() {
            if edns.version() != 0 {
                let res = badvers_reply(&chain.request);
                let _ = chain.writer().write_msg(res);
                return true;
            }
        }

        if entry.rate() > 0 {
            if let Some(limiter) = self.limits.get(entry.rate()) {
                if !limiter.allow(key) {
                    let res = synthetic_reply(&chain.request, ResponseCode::Refused);
                    let _ = chain.writer().write_msg(res);
                    return true;
                }
            }
        }

        let mut res = match entry.to_msg(&chain.request, now) {
            Ok(res) => res,
            Err(e) => {
                // Raced expiry: treat as a miss.
                debug!(key, error = %e, "cached entry unusable");
                self.stores.remove(key);
                return false;
            }
        };

        self.complete_cname_chain(&mut res, q, now);

        if entry.should_prefetch(self.prefetch_pct, now) && entry.claim_prefetch() {
            self.queue.enqueue(PrefetchRequest {
                key,
                request: chain.request.clone(),
            });
        }

        self.metrics.hit();
        if let Err(e) = chain.writer().write_msg(res) {
            debug!(error = %e, "failed to write cached response");
        }
        true
    }

    /// When the answer ends in a CNAME whose target we also hold, splice the
    /// cached target answers in, following at most [`CNAME_CHAIN_MAX`] hops.
    fn complete_cname_chain(&self, res: &mut Message, q: &Query, now: u64) {
        if !matches!(q.query_type(), RecordType::A | RecordType::AAAA) {
            return;
        }
        let cd = res.checking_disabled();
        for _ in 0..CNAME_CHAIN_MAX {
            let Some(target) = unresolved_cname_target(res, q.query_type()) else {
                return;
            };
            let key = question_key(&target, q.query_type(), q.query_class(), cd);
            let Some(entry) = self.stores.positive.get(key, now) else {
                return;
            };
            let mut probe = Message::new();
            probe.add_query(Query::query(target, q.query_type()));
            let Ok(mut extra) = entry.to_msg(&probe, now) else {
                return;
            };
            let answers = extra.take_answers();
            if answers.is_empty() {
                return;
            }
            for r in answers {
                res.add_answer(r);
            }
        }
    }
}

#[async_trait]
impl Handler for CacheHandler {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn serve_dns(&self, chain: &mut Chain) {
        let now = unix_now();

        if let Some((name, qtype)) = purge_request(&chain.request) {
            self.purge(&name, qtype);
            let res = synthetic_reply(&chain.request, ResponseCode::NoError);
            let _ = chain.writer().write_msg(res);
            return;
        }

        let Some(q) = chain.request.queries().first().cloned() else {
            chain.next().await;
            return;
        };
        // Meta queries, updates, and exotic classes pass straight through.
        if chain.request.op_code() != OpCode::Query
            || q.query_class() != DNSClass::IN
            || matches!(q.query_type(), RecordType::AXFR | RecordType::IXFR)
        {
            chain.next().await;
            return;
        }

        let cd = chain.request.checking_disabled();
        let key = question_key(q.name(), q.query_type(), q.query_class(), cd);

        // Park behind any identical query already in flight, then re-check.
        self.stampede.wait(key).await;

        if self.try_serve(chain, &q, key, now) {
            return;
        }

        self.metrics.miss();
        let inner = chain.replace_writer(Box::new(SinkWriter));
        let _ = chain.replace_writer(Box::new(StoreWriter {
            inner,
            key,
            stores: self.stores.clone(),
        }));
        self.stampede.add(key);
        chain.next().await;
        self.stampede.done(key);
    }
}

/// Wraps the client's writer on the miss path: classifies and stores the
/// outgoing response, then forwards it untouched. Cache trouble never blocks
/// the reply.
struct StoreWriter {
    inner: Box<dyn ResponseWriter>,
    key: u64,
    stores: Arc<Stores>,
}

impl ResponseWriter for StoreWriter {
    fn write_msg(&mut self, msg: Message) -> Result<()> {
        if !msg.truncated() && !msg.queries().is_empty() {
            self.stores.store_response(self.key, &msg, unix_now());
        }
        self.inner.write_msg(msg)
    }
}

/// CHAOS-class NULL question whose name is base64("QTYPE:QNAME").
fn purge_request(req: &Message) -> Option<(Name, RecordType)> {
    let q = req.queries().first()?;
    if q.query_class() != DNSClass::CH || q.query_type() != RecordType::NULL {
        return None;
    }
    let label = q.name().to_utf8();
    let (qname, qtype) = parse_purge_qname(label.trim_end_matches('.'))?;
    let name = Name::from_utf8(&qname).ok()?;
    Some((name, qtype))
}

fn unresolved_cname_target(res: &Message, qtype: RecordType) -> Option<Name> {
    for r in res.answers() {
        if let Some(RData::CNAME(cname)) = r.data() {
            let target = &cname.0;
            let resolved = res.answers().iter().any(|a| {
                a.name() == target
                    && (a.record_type() == qtype || a.record_type() == RecordType::CNAME)
            });
            if !resolved {
                return Some(target.clone());
            }
        }
    }
    None
}

fn synthetic_reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut res = Message::new();
    res.set_id(req.id());
    res.set_message_type(MessageType::Response);
    res.set_op_code(req.op_code());
    res.set_recursion_desired(req.recursion_desired());
    res.set_recursion_available(true);
    res.set_response_code(rcode);
    for q in req.queries() {
        res.add_query(q.clone());
    }
    res
}

fn badvers_reply(req: &Message) -> Message {
    let mut res = synthetic_reply(req, ResponseCode::BADVERS);
    let mut edns = Edns::new();
    edns.set_version(0);
    edns.set_max_payload(512);
    res.set_edns(edns);
    res
}
