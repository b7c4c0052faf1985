//! Binary entry point for a Store process: owns a directory of volumes on disk, serves
//! the needle HTTP surface, and reports to the Directory via heartbeat, compaction,
//! and garbage-collection background tasks.
//!
//! Grounded in the teacher's `store/main.rs` (load the machine, start its background
//! thread, serve HTTP, stop cleanly on shutdown), ported from its Rocket/thread
//! scaffolding onto `axum` and `tokio`.

use clap::Parser;
use haystack::background::BackgroundTask;
use haystack::client::cache_client::CacheClient;
use haystack::client::directory_client::DirectoryClient;
use haystack::config::HaystackConfig;
use haystack::store::machine::StoreMachine;
use haystack::store::{compaction, gc, heartbeat, routes};
use haystack::store::StoreContext;
use haystack::ratelimit::RateLimiter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "haystore", about = "Run a Haystack store machine")]
struct Args {
    /// This store's cluster-unique machine id.
    #[arg(long)]
    machine_id: u32,

    /// Directory for on-disk volumes.
    #[arg(long, default_value = "/var/lib/haystack/store")]
    data_dir: PathBuf,

    /// Address this process listens on and advertises to the Directory and peers.
    #[arg(long, default_value = "127.0.0.1:4000")]
    addr: String,

    /// Directory replica addresses, tried in order for leader-only writes.
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

    // Learn the cluster id from whichever Directory replica answers first, so a
    // freshly bootstrapped store never invents its own.
    let cluster_id = directory.cluster_id().await?;

    let machine = Arc::new(StoreMachine::load(
        &args.data_dir,
        cluster_id,
        args.machine_id,
        config.max_volume_size,
    )?);

    // Registers this store with the Directory immediately rather than waiting for the
    // first scheduled heartbeat tick.
    heartbeat::run_once(&machine, &directory, &args.addr).await;

    let ctx = Arc::new(StoreContext::new(machine.clone(), args.addr.clone(), directory.clone(), cache));

    let heartbeat_task = {
        let machine = machine.clone();
        let directory = directory.clone();
        let self_addr = args.addr.clone();
        BackgroundTask::spawn(config.heartbeat_interval(), move || {
            let machine = machine.clone();
            let directory = directory.clone();
            let self_addr = self_addr.clone();
            async move { heartbeat::run_once(&machine, &directory, &self_addr).await }
        })
    };

    let compaction_task = {
        let machine = machine.clone();
        let config = config.clone();
        // No dedicated interval is configurable for this sweep; once a minute is
        // frequent enough to catch a volume shortly after it seals.
        BackgroundTask::spawn(std::time::Duration::from_secs(60), move || {
            let machine = machine.clone();
            let config = config.clone();
            async move { compaction::run_once(&machine, &config).await }
        })
    };

    let gc_task = {
        let machine = machine.clone();
        let directory = directory.clone();
        let gc_state = Arc::new(gc::GcState::new());
        // No dedicated interval is configurable for this sweep either; matches the
        // compaction sweep's cadence since both are low-urgency disk housekeeping.
        BackgroundTask::spawn(std::time::Duration::from_secs(60), move || {
            let machine = machine.clone();
            let directory = directory.clone();
            let gc_state = gc_state.clone();
            async move { gc::run_once(&machine, &directory, &gc_state).await }
        })
    };

    let limiter = RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec);
    let app = routes::router(ctx, limiter);

    let addr: SocketAddr = args.addr.parse()?;
    tracing::info!(%addr, machine_id = args.machine_id, "store listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    heartbeat_task.stop().await;
    compaction_task.stop().await;
    gc_task.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
