//! Background refresh of hot cache entries.
//!
//! Hits close to expiry enqueue a refresh request; a fixed pool of workers
//! drains the queue, resolves each request with a 5-second budget, and
//! re-admits the fresh response. The queue is bounded and lossy: a full
//! queue drops the request and bumps a counter.

use crate::entry::unix_now;
use crate::metrics::CacheMetrics;
use crate::store::Stores;
use hickory_proto::op::Message;
use nimbledns_core::chain::Exchanger;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PrefetchRequest {
    pub key: u64,
    pub request: Message,
}

pub struct PrefetchQueue {
    tx: mpsc::Sender<PrefetchRequest>,
    rx: Mutex<Option<mpsc::Receiver<PrefetchRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<CacheMetrics>,
}

impl PrefetchQueue {
    pub fn new(capacity: usize, metrics: Arc<CacheMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Non-blocking submit; dropped silently (counted) when the queue is
    /// full.
    pub fn enqueue(&self, req: PrefetchRequest) {
        if self.tx.try_send(req).is_err() {
            self.metrics.prefetch_dropped();
        }
    }

    /// Spawn the worker pool. Requests enqueued before the pool starts sit
    /// in the channel until a worker picks them up.
    pub fn start(
        &self,
        workers: usize,
        resolver: Arc<dyn Exchanger>,
        stores: Arc<Stores>,
        shutdown: watch::Receiver<bool>,
    ) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = self.workers.lock();
        for _ in 0..workers.max(1) {
            handles.push(tokio::spawn(worker_loop(
                rx.clone(),
                resolver.clone(),
                stores.clone(),
                self.metrics.clone(),
                shutdown.clone(),
            )));
        }
    }

    /// Join the workers. The owner signals its shutdown watch first.
    pub async fn stop(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PrefetchRequest>>>,
    resolver: Arc<dyn Exchanger>,
    stores: Arc<Stores>,
    metrics: Arc<CacheMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let req = tokio::select! {
            _ = shutdown.changed() => break,
            req = async { rx.lock().await.recv().await } => match req {
                Some(req) => req,
                None => break,
            },
        };
        process_prefetch(req, resolver.as_ref(), &stores, &metrics).await;
    }
}

async fn process_prefetch(
    req: PrefetchRequest,
    resolver: &dyn Exchanger,
    stores: &Stores,
    metrics: &CacheMetrics,
) {
    match tokio::time::timeout(EXCHANGE_TIMEOUT, resolver.exchange(req.request)).await {
        Ok(Ok(res)) if !res.answers().is_empty() => {
            stores.store_response(req.key, &res, unix_now());
            metrics.prefetched();
        }
        Ok(Ok(_)) => debug!(key = req.key, "prefetch refresh came back empty"),
        Ok(Err(e)) => debug!(key = req.key, error = %e, "prefetch exchange failed"),
        Err(_) => debug!(key = req.key, "prefetch exchange timed out"),
    }
}
