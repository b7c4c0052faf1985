//! `hay`: the end-user command-line client for uploading, downloading, and
//! inspecting photos in a Haystack cluster.
//!
//! Grounded in the teacher's `main.rs` CLI (subcommands for upload/download/stats),
//! ported from its clap-2 `App`/`SubCommand` builder onto clap's derive API, which is
//! the feature this crate's `clap` dependency actually enables.

use clap::{Parser, Subcommand};
use haystack::client::Client;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hay", about = "Upload, download, and inspect photos in a Haystack cluster")]
struct Args {
    /// Directory replica addresses, tried in order for leader-only writes.
    #[arg(long, value_delimiter = ',', global = true)]
    directory_addrs: Vec<String>,

    /// Optional Cache node address, for a primed read/write path.
    #[arg(long, global = true)]
    cache_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file as a new photo, printing its assigned id.
    Upload { path: PathBuf },

    /// Download a photo by id to a local file.
    Download { id: u64, path: PathBuf },

    /// Report a photo's size, checksum, and healthy replica count.
    Status { id: u64 },

    /// List every store known to the cluster and its reported capacity.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let client = Client::new(args.directory_addrs, args.cache_addr);

    match args.command {
        Command::Upload { path } => {
            let data = std::fs::read(&path)?;
            let summary = client.upload(data).await?;
            println!("uploaded photo {} ({} replicas written)", summary.id, summary.replicas_written);
        }
        Command::Download { id, path } => {
            let data = client.download(id).await?;
            std::fs::write(&path, &data)?;
            println!("wrote {} bytes to {}", data.len(), path.display());
        }
        Command::Status { id } => {
            let status = client.status(id).await?;
            println!(
                "photo {}: {} bytes, checksum {}, {} healthy replicas",
                status.id,
                status.size,
                hex_encode(&status.checksum),
                status.healthy_replicas
            );
        }
        Command::Stats => {
            let stores = client.stats().await?;
            for store in stores {
                println!(
                    "machine {} ({}): {} free bytes, {} status",
                    store.machine_id, store.addr, store.free_bytes, store.status
                );
            }
        }
    }

    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
