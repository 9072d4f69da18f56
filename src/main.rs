//! tiered-cache: unified caching service.
//!
//! Builds the caches listed in the configuration file into one registry,
//! sweeps expired entries in the background and exposes an admin HTTP API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use tiered_cache::cache::registry::CacheRegistry;
use tiered_cache::cache::similarity::{Embedder, HashingEmbedder};
use tiered_cache::config::{Cli, Config, RemoteBackendKind};
use tiered_cache::remote::adapter::{InMemoryRemoteStore, RemoteStore};
use tiered_cache::server::api::{build_router, AppState};
use tiered_cache::server::metrics::CacheMetrics;

fn build_registry(config: &Config) -> anyhow::Result<CacheRegistry> {
    let remote: Arc<dyn RemoteStore> = match config.remote.backend {
        RemoteBackendKind::InMemory => Arc::new(InMemoryRemoteStore::new("in-memory-remote")),
    };
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding.dimensions));

    let registry = CacheRegistry::new();
    for definition in &config.caches {
        if registry.get(&definition.config.name).is_some() {
            anyhow::bail!("cache {:?} is defined twice", definition.config.name);
        }
        registry.create_from_definition(definition, remote.clone(), embedder.clone())?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tiered_cache=debug,tower_http=debug"
    } else {
        "tiered_cache=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("tiered-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        caches = config.caches.len(),
        remote = ?config.remote.backend,
        purge_interval_secs = config.maintenance.purge_interval_secs,
        "Configuration loaded"
    );

    let registry = Arc::new(build_registry(&config)?);

    // Periodic sweep of expired entries.
    if config.maintenance.purge_interval_secs > 0 {
        let registry = registry.clone();
        let period = Duration::from_secs(config.maintenance.purge_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let purged = registry.purge_expired();
                if purged > 0 {
                    debug!(purged, "Expired entries swept");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        registry,
        metrics: CacheMetrics::new()?,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen.unwrap_or(config.server.listen);
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
