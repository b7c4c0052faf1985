//! Binary entry point for a Cache node: a bounded in-memory LRU fronting the Store
//! tier, with no durable state of its own.
//!
//! Grounded in the teacher's `cache/main.rs` (`run(dir, port)`, load and serve,
//! nothing else), ported onto `axum`/`tokio`.

use clap::Parser;
use haystack::cache::machine::CacheMachine;
use haystack::cache::routes;
use haystack::config::HaystackConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "haycache", about = "Run a Haystack cache node")]
struct Args {
    /// Address this process listens on.
    #[arg(long, default_value = "127.0.0.1:4100")]
    addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = HaystackConfig::load()?;

    let cache = Arc::new(CacheMachine::new(config.cache_capacity_bytes, config.cache_ttl()));
    let app = routes::router(cache);

    let addr: SocketAddr = args.addr.parse()?;
    tracing::info!(%addr, "cache listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
