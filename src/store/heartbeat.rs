//! Periodically reports this store's load and capacity to the Directory, as
//! described by the spec's heartbeat contract: `{store_id, free_bytes, ops_60s,
//! status=HEALTHY}` every `HEARTBEAT_INTERVAL` seconds.

use crate::client::directory_client::DirectoryClient;
use crate::store::machine::StoreMachine;
use std::sync::Arc;
use tracing::warn;

pub async fn run_once(machine: &Arc<StoreMachine>, directory: &DirectoryClient, self_addr: &str) {
    let stats = machine.stats();
    if let Err(e) = directory
        .heartbeat(stats.machine_id, self_addr, stats.free_bytes, stats.ops_window_60s)
        .await
    {
        warn!(error = %e, "heartbeat to directory failed");
    }
}
