//! Garbage collection: periodically fetches the Directory's view of which photo ids
//! are still live on this store and tombstones any on-disk needle the Directory no
//! longer considers ours. Tombstones are reclaimed on the next compaction pass.
//!
//! A needle is never tombstoned the first pass it looks dead. The Directory replica
//! answering `live_ids_for_store` may itself be a follower lagging behind a very
//! recent commit; deleting on first sight would let that lag destroy a blob that is
//! actually still live. Instead a needle has to look dead across two consecutive
//! passes before GC acts on it, giving any lagging follower one full sweep interval
//! to catch up — the same half-window/full-window hysteresis `directory::health` uses
//! for store status, applied here to individual needles.

use crate::client::directory_client::DirectoryClient;
use crate::store::machine::StoreMachine;
use crate::types::{PhotoId, VolumeId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Tracks needles that looked dead on the previous pass but haven't yet survived a
/// second confirmation. One instance is shared across every GC tick for a store.
#[derive(Default)]
pub struct GcState {
    pending: Mutex<HashSet<(VolumeId, PhotoId)>>,
}

impl GcState {
    pub fn new() -> GcState {
        GcState::default()
    }
}

pub async fn run_once(machine: &Arc<StoreMachine>, directory: &DirectoryClient, state: &Arc<GcState>) {
    let machine_id = machine.machine_id();

    let live_ids = match directory.live_ids_for_store(machine_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "gc: could not fetch live id set from directory, skipping this pass");
            return;
        }
    };
    let live: HashSet<_> = live_ids.into_iter().collect();

    let known = machine.all_known_ids();
    let mut pending = state.pending.lock().unwrap();
    let mut reclaimed = 0u64;
    let mut still_dead = HashSet::new();

    for (volume_id, photo_id) in known {
        if live.contains(&photo_id) {
            continue;
        }

        let key = (volume_id, photo_id);
        if pending.remove(&key) {
            match machine.delete(volume_id, photo_id) {
                Ok(()) => reclaimed += 1,
                Err(crate::error::StoreError::NotFound) => {} // already tombstoned
                Err(e) => warn!(volume_id, photo_id, error = %e, "gc: failed to tombstone needle"),
            }
        } else {
            still_dead.insert(key);
        }
    }

    *pending = still_dead;

    if reclaimed > 0 {
        info!(reclaimed, "gc: tombstoned needles unknown to the directory for two consecutive passes");
    }
}
