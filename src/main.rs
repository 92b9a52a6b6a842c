use anyhow::Result;
use clap::Parser;
use nimbledns_api::ApiServer;
use nimbledns_cache::CacheHandler;
use nimbledns_core::chain::{handlers, ChainExchanger, Exchanger, Handler};
use nimbledns_core::config::Config;
use nimbledns_recursor::upstream::ForwardHandler;
use nimbledns_recursor::DnsServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "nimbledns", about = "NimbleDNS - caching DNS forwarder")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/nimbledns/nimbledns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };

    // Initialize logging
    init_logging(&config.logging);

    info!(listen = %config.dns.listen, "starting nimbledns");

    // The query pipeline: cache in front, upstream forwarder behind it.
    let cache = Arc::new(CacheHandler::new(&config.cache));
    let forward: Arc<dyn Handler> = Arc::new(ForwardHandler::from_config(&config.upstream)?);
    let chain = handlers(vec![cache.clone() as Arc<dyn Handler>, forward.clone()]);

    // Prefetch refreshes enter the pipeline after the cache so a refresh is
    // never answered by the entry it is trying to replace.
    let resolver: Arc<dyn Exchanger> = Arc::new(ChainExchanger::new(handlers(vec![forward])));
    cache.start(resolver);

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    // Start DNS listeners
    let dns = DnsServer::new(&config.dns.listen, chain.clone())?;
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = dns.run(rx).await {
            error!("dns server error: {e}");
        }
    }));

    // Start admin API
    if config.api.enabled {
        let exchanger: Arc<dyn Exchanger> = Arc::new(ChainExchanger::new(chain.clone()));
        let api = ApiServer::new(
            &config.api.listen,
            cache.clone(),
            exchanger,
            config.api.token.clone(),
        )?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api.run(rx).await {
                error!("admin API error: {e}");
            }
        }));
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    // Stop cache workers
    cache.stop().await;

    // Wait for all tasks to finish
    for task in tasks {
        let _ = task.await;
    }

    info!("nimbledns stopped");
    Ok(())
}

fn init_logging(config: &nimbledns_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}
