//! wgplane daemon
//!
//! Manages WireGuard server interfaces and peers: a SQLite-backed config
//! store as source of truth, a cache in front of hot reads, the wg tools
//! for live state, and a reconciler that keeps the two converged.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgplane_common::{ConfigStore, MemoryCache, RedisCache, StateCache};

mod api;
mod config;
mod driver;
mod lifecycle;
mod reconciler;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "wgplaned")]
#[command(about = "wgplane daemon - WireGuard peer lifecycle and reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// API listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Cache endpoint URL (e.g. redis://127.0.0.1:6379)
    #[arg(long)]
    cache_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wgplane daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, CLI flags winning over the file
    let config_path = cli
        .config
        .unwrap_or_else(|| wgplane_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(url) = cli.cache_url {
        config.cache.url = Some(url);
    }

    tokio::fs::create_dir_all(&config.store_path).await?;

    // The wg binary is a hard requirement; refusing to start beats
    // accepting enrollments that can never be applied
    let driver = Arc::new(driver::WgTool::new(config.wireguard.clone()));
    driver.probe().await?;

    let store = ConfigStore::open(config.db_path())?;
    ensure_token_secret(&config)?;

    let cache: Arc<dyn StateCache> = match &config.cache.url {
        Some(url) => match RedisCache::connect(url).await {
            Ok(redis) => {
                info!("Connected to cache at {}", url);
                Arc::new(redis)
            }
            Err(e) => {
                // Fail-open: the store serves every read the cache would
                warn!("Cache at {} unavailable, using in-process cache: {}", url, e);
                Arc::new(MemoryCache::new())
            }
        },
        None => Arc::new(MemoryCache::new()),
    };

    let lifecycle = lifecycle::PeerLifecycleManager::new(
        store.clone(),
        cache,
        driver.clone(),
        config.clone(),
    );

    let reconciler = reconciler::Reconciler::new(store, driver, config.clone());
    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    let app = api::router(Arc::new(api::AppState { lifecycle }));
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("API listening on {}", config.listen);

    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            if let Err(e) = result {
                tracing::error!("API server error: {}", e);
            }
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                tracing::error!("Reconciler error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}

/// Load or generate the token-signing secret. Token issuance policy lives
/// in the fronting layer; the daemon only guarantees the key material
/// exists and survives restarts.
fn ensure_token_secret(config: &DaemonConfig) -> anyhow::Result<()> {
    let path = config.token_secret_path();
    if path.exists() {
        return Ok(());
    }

    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, secret)?;
    info!("Generated token secret at {}", path.display());
    Ok(())
}
