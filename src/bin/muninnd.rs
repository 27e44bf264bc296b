//! muninnd: Muninn caching proxy daemon.
//!
//! Sits between a GraphQL client and its origin, running every request
//! through the persistent response cache so that the client keeps working
//! when the origin is slow or unreachable.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use muninn::clock::SystemClock;
use muninn::server::config::Config;
use muninn::worker::{CacheStorage, Interceptor, ReqwestUpstream};

/// Muninn daemon, an offline-first GraphQL caching proxy.
#[derive(Parser)]
#[command(name = "muninnd")]
#[command(version = muninn::PKG_VERSION)]
#[command(about = "Muninn GraphQL caching proxy")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "MUNINN_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: info for the daemon; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(address) = args.address {
        config.server.address = address;
    }

    // Parse address
    let addr: SocketAddr = config
        .server
        .address
        .parse()
        .map_err(|e| muninn::MuninnError::Configuration(format!("Invalid address: {e}")))?;

    let upstream_base = config.upstream_base()?;
    let cache_dir = config.cache_dir()?;
    let storage = CacheStorage::open(&cache_dir, Arc::new(SystemClock))?;
    let upstream = ReqwestUpstream::new(config.upstream_timeout())?;
    let interceptor = Arc::new(Interceptor::new(
        config.interceptor_config(),
        Arc::new(storage),
        Arc::new(upstream),
    ));

    // The daemon's config always skips waiting, so install also activates.
    interceptor.on_install();

    if let Some(period) = config.sweep_interval() {
        let sweeper = interceptor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let removed = sweeper.sweep();
                debug!(removed, "periodic cache sweep");
            }
        });
    }

    info!(
        version = muninn::version_string(),
        %addr,
        upstream = %config.upstream.endpoint,
        cache_dir = %cache_dir.display(),
        "muninnd starting"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        muninn::server::router(interceptor.clone(), upstream_base),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    interceptor.storage().flush().await;

    info!("muninnd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
