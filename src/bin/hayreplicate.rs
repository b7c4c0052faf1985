//! Binary entry point for the Replication Manager: the background process that keeps
//! every blob at its desired replica count, adapting that target to read hotness and
//! running a nightly full audit against the whole catalogue.
//!
//! Grounded in the teacher's `pitchfork/mod.rs`, which sketches this same
//! responsibility as a block of TODOs and never implements it; this binary follows
//! the same background-task/HTTP-client shape used by the other processes in this
//! crate instead.

use clap::Parser;
use haystack::background::BackgroundTask;
use haystack::client::cache_client::CacheClient;
use haystack::client::directory_client::DirectoryClient;
use haystack::config::HaystackConfig;
use haystack::coordination::Coordinator;
use haystack::replication::{routes, ReplicationManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hayreplicate", about = "Run the Haystack replication manager")]
struct Args {
    /// Address this process listens on for its observational status endpoint.
    #[arg(long, default_value = "127.0.0.1:4200")]
    addr: String,

    /// Directory replica addresses.
    #[arg(long, value_delimiter = ',')]
    directory_addrs: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = HaystackConfig::load()?;

    let directory = DirectoryClient::new(args.directory_addrs.clone());
    let cache = config.cache_addr.clone().map(CacheClient::new);
    let coordinator = Coordinator::connect(&config.redis_url).await?;

    let manager = Arc::new(ReplicationManager::new(
        directory,
        cache,
        coordinator,
        config.clone(),
        args.addr.clone(),
    ));

    let tick_task = {
        let manager = manager.clone();
        BackgroundTask::spawn(config.replication_tick(), move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.run_once().await {
                    tracing::warn!(error = %e, "replication tick failed");
                }
            }
        })
    };

    let app = routes::router(manager);

    let addr: SocketAddr = args.addr.parse()?;
    tracing::info!(%addr, "replication manager listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tick_task.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
