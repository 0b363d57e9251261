use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

use cachegate::{CacheStore, ExpirySweeper, ProxyConfig, ProxyHandler, Server, StoreEngine};

#[derive(Parser)]
#[command(name = "cachegate")]
#[command(about = "Caching reverse proxy with TTL-expiring persistent storage")]
#[command(version)]
struct Cli {
    /// JSON config file
    #[arg(short, long, env = "CACHEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Origin base URL (overrides remote_url)
    #[arg(short, long, env = "CACHEGATE_URL")]
    url: Option<Url>,

    /// Listen port (overrides port)
    #[arg(short, long, env = "CACHEGATE_PORT")]
    port: Option<u16>,

    /// Cache TTL in seconds (overrides ttl_seconds)
    #[arg(short, long, env = "CACHEGATE_TTL")]
    ttl: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = match (&self.config, &self.url) {
            (Some(path), _) => ProxyConfig::from_file(path)?,
            (None, Some(url)) => ProxyConfig::new(url.clone()),
            (None, None) => anyhow::bail!("either --config or --url is required"),
        };
        if let Some(url) = self.url {
            config.remote_url = url;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ttl) = self.ttl {
            config.ttl_seconds = ttl;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Cli::parse().into_config()?;

    let store = match config.store_engine {
        StoreEngine::Sled => CacheStore::open(&config.store_path).with_context(|| {
            format!("failed to open cache store at {}", config.store_path.display())
        })?,
        StoreEngine::Memory => CacheStore::in_memory(),
    };

    let server = Server::bind(config.bind_addr()).await?;
    info!(
        origin = %config.remote_url,
        ttl_seconds = config.ttl_seconds,
        rules = config.cacheable_paths.len(),
        "proxy configured"
    );

    let shutdown = CancellationToken::new();
    let sweeper = ExpirySweeper::new(store.clone(), config.sweep_interval()).spawn(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => {
                error!(error = %e, "failed to listen for shutdown signal");
                return;
            }
        }
        signal.cancel();
    });

    let handler = Arc::new(ProxyHandler::new(config, store.clone())?);
    let served = handler.serve(server, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "expiry sweeper panicked");
    }
    store.flush().context("failed to flush cache store")?;
    served?;
    Ok(())
}
