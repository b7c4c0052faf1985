//! Periodic compaction sweep: finds sealed volumes whose live-byte fraction has
//! fallen below the configured efficiency threshold and rewrites them in place.
//!
//! Grounded in the teacher's `src/background_thread.rs` scheduling idiom, now run as
//! a [`crate::background::BackgroundTask`] instead of an OS thread.

use crate::config::HaystackConfig;
use crate::store::machine::StoreMachine;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run_once(machine: &Arc<StoreMachine>, config: &HaystackConfig) {
    let candidates = machine.compaction_candidates(config.compaction_efficiency_threshold);
    if candidates.is_empty() {
        return;
    }

    for volume_id in candidates {
        let machine = machine.clone();
        let result = tokio::task::spawn_blocking(move || machine.compact_volume(volume_id)).await;

        match result {
            Ok(Ok(())) => info!(volume_id, "compacted volume"),
            Ok(Err(e)) => warn!(volume_id, error = %e, "compaction failed"),
            Err(e) => warn!(volume_id, error = %e, "compaction task panicked"),
        }
    }
}
