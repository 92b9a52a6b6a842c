//! Admin HTTP surface: the only external actuator on the cache.

pub mod blocklist;
pub mod routes;
pub mod security;

use blocklist::BlockList;
use nimbledns_cache::CacheHandler;
use nimbledns_core::chain::Exchanger;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct ApiServer {
    listen_addr: SocketAddr,
    cache: Arc<CacheHandler>,
    exchanger: Arc<dyn Exchanger>,
    token: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheHandler>,
    pub exchanger: Arc<dyn Exchanger>,
    pub blocklist: Arc<BlockList>,
    pub token: Option<Arc<String>>,
}

impl ApiServer {
    pub fn new(
        listen: &str,
        cache: Arc<CacheHandler>,
        exchanger: Arc<dyn Exchanger>,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            listen_addr: listen.parse()?,
            cache,
            exchanger,
            token,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let state = AppState {
            cache: self.cache,
            exchanger: self.exchanger,
            blocklist: Arc::new(BlockList::new()),
            token: self.token.map(Arc::new),
        };

        let app = routes::router()
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                security::bearer_auth,
            ))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("admin API listening on {}", self.listen_addr);

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}
