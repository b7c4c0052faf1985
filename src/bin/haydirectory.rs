//! Binary entry point for a Directory replica: the metadata authority for the
//! cluster. Exactly one replica at a time holds write leadership; all replicas serve
//! reads and replicate a leader's writes via `sync_log`.
//!
//! Grounded in the teacher's `directory/main.rs` (load the database, start the
//! election and health-check background work, serve HTTP), ported onto `axum`/`tokio`
//! and `diesel` in place of Rocket and the teacher's hand-rolled Postgres client.

use clap::Parser;
use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use haystack::background::BackgroundTask;
use haystack::config::HaystackConfig;
use haystack::coordination::Coordinator;
use haystack::directory::db::DB;
use haystack::directory::election::LeaderElection;
use haystack::directory::{routes, Directory};
use haystack::ratelimit::RateLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "haydirectory", about = "Run a Haystack directory replica")]
struct Args {
    /// Address this process listens on and advertises as the current leader.
    #[arg(long, default_value = "127.0.0.1:5000")]
    addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = HaystackConfig::load()?;

    {
        let mut conn = PgConnection::establish(&config.database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("running migrations: {e}"))?;
    }

    let db = DB::connect(&config.database_url)?;
    let coordinator = Coordinator::connect(&config.redis_url).await?;
    let election = LeaderElection::new(coordinator, args.addr.clone(), config.leader_lease_ttl());
    let directory = Arc::new(Directory::new(db, election, config.clone()));

    let election_task = {
        let directory = directory.clone();
        BackgroundTask::spawn(config.leader_refresh_interval(), move || {
            let directory = directory.clone();
            async move { directory.election().tick().await }
        })
    };

    let health_task = {
        let directory = directory.clone();
        // Runs on the same cadence as the leader lease refresh; only the leader's
        // scan does anything, so followers just no-op each tick.
        BackgroundTask::spawn(config.leader_refresh_interval(), move || {
            let directory = directory.clone();
            async move {
                if let Err(e) = directory.run_health_scan() {
                    tracing::warn!(error = %e, "health scan failed");
                }
            }
        })
    };

    let push_task = {
        let directory = directory.clone();
        BackgroundTask::spawn(config.follower_sync_interval(), move || {
            let directory = directory.clone();
            async move { directory.push_to_followers().await }
        })
    };

    let pull_task = {
        let directory = directory.clone();
        BackgroundTask::spawn(config.follower_sync_interval(), move || {
            let directory = directory.clone();
            async move { directory.pull_from_leader().await }
        })
    };

    let read_window_task = {
        let directory = directory.clone();
        // Drops read-rate counters for photos that have gone quiet, so this map
        // doesn't grow without bound over the life of the process.
        BackgroundTask::spawn(Duration::from_secs(300), move || {
            let directory = directory.clone();
            async move { directory.sweep_read_windows() }
        })
    };

    let limiter = RateLimiter::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec);
    let app = routes::router(directory.clone(), limiter);

    let addr: SocketAddr = args.addr.parse()?;
    tracing::info!(%addr, "directory listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    election_task.stop().await;
    health_task.stop().await;
    push_task.stop().await;
    pull_task.stop().await;
    read_window_task.stop().await;
    directory.election().resign().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
