//! Push-based metadata replication from the Directory leader to its followers, with a
//! polling anti-entropy fallback for whatever a push misses.
//!
//! Every leader-side mutation is appended to `sync_log` as a serialized [`SyncOp`] and
//! forwarded to followers in sequence order; a follower applies ops idempotently and
//! persists its own cursor so a restart cannot replay or skip entries.

use crate::directory::db::DB;
use crate::error::DirectoryResult;
use crate::types::{MachineId, MachineStatus, PhotoId, VolumeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncOp {
    CommitPhoto {
        photo_id: PhotoId,
        cookie: Vec<u8>,
        size: u64,
        checksum: Vec<u8>,
        desired_replicas: usize,
        locations: Vec<(MachineId, VolumeId)>,
    },
    MarkDeleted {
        photo_id: PhotoId,
    },
    SetDesiredReplicas {
        photo_id: PhotoId,
        desired_replicas: usize,
    },
    AddLocation {
        photo_id: PhotoId,
        machine_id: MachineId,
        volume_id: VolumeId,
    },
    RemoveLocation {
        photo_id: PhotoId,
        machine_id: MachineId,
    },
    RegisterStore {
        machine_id: MachineId,
        addr: String,
    },
    StoreStatus {
        machine_id: MachineId,
        status: MachineStatus,
    },
}

/// Records `op` in the replication log and returns its sequence number. Called by the
/// leader immediately after the corresponding local mutation succeeds.
pub fn log(db: &DB, op: &SyncOp) -> DirectoryResult<i64> {
    let json = serde_json::to_string(op).expect("SyncOp always serializes");
    db.append_sync_op(json)
}

/// Applies a previously-logged op to this (follower's) local database. Mutations are
/// written so replaying an op twice is harmless: `commit_photo` itself no-ops on a
/// conflicting id via `ON CONFLICT DO NOTHING`, and location add/remove and status
/// updates are naturally idempotent. The `get_photo` check here is just a fast path
/// that skips the write entirely on the common case of an already-applied op.
pub fn apply(db: &DB, op: &SyncOp) -> DirectoryResult<()> {
    match op {
        SyncOp::CommitPhoto {
            photo_id,
            cookie,
            size,
            checksum,
            desired_replicas,
            locations,
        } => {
            if db.get_photo(*photo_id)?.is_none() {
                db.commit_photo(*photo_id, cookie, *size, checksum, *desired_replicas, locations)?;
            }
        }
        SyncOp::MarkDeleted { photo_id } => {
            let _ = db.mark_deleted(*photo_id);
        }
        SyncOp::SetDesiredReplicas { photo_id, desired_replicas } => {
            db.set_desired_replicas(*photo_id, *desired_replicas)?;
        }
        SyncOp::AddLocation {
            photo_id,
            machine_id,
            volume_id,
        } => db.add_location(*photo_id, *machine_id, *volume_id)?,
        SyncOp::RemoveLocation { photo_id, machine_id } => db.remove_location(*photo_id, *machine_id)?,
        SyncOp::RegisterStore { machine_id, addr } => db.register_store(*machine_id, addr)?,
        SyncOp::StoreStatus { machine_id, status } => db.set_store_status(*machine_id, *status)?,
    }
    Ok(())
}

/// Leader side: per-follower push state, tracking the last sequence number each
/// follower has acknowledged so we only ever send the tail of the log.
pub struct FollowerCursor {
    pub addr: String,
    pub last_acked: i64,
}

const PUSH_BATCH: i64 = 500;
const MAX_PUSH_RETRIES: u32 = 3;

/// Pushes any new ops to `follower`, retrying with bounded exponential backoff. A
/// follower that stays unreachable simply falls behind until its own anti-entropy
/// poll (or the next successful push) catches it up; we never block the leader's
/// control loop waiting for a slow follower.
pub async fn push_to_follower(
    client: &reqwest::Client,
    db: &DB,
    cursor: &mut FollowerCursor,
) -> DirectoryResult<()> {
    let ops = db.sync_ops_after(cursor.last_acked, PUSH_BATCH)?;
    if ops.is_empty() {
        return Ok(());
    }

    let batch: Vec<serde_json::Value> = ops
        .iter()
        .map(|(seq, op_json)| {
            serde_json::json!({ "seq": seq, "op": serde_json::from_str::<SyncOp>(op_json).ok() })
        })
        .collect();

    let url = format!("http://{}/sync", cursor.addr);
    let mut delay = Duration::from_millis(100);

    for attempt in 0..MAX_PUSH_RETRIES {
        match client.post(&url).json(&serde_json::json!({ "ops": batch })).send().await {
            Ok(resp) if resp.status().is_success() => {
                cursor.last_acked = ops.last().unwrap().0;
                return Ok(());
            }
            Ok(resp) => {
                warn!(follower = %cursor.addr, status = %resp.status(), attempt, "sync push rejected");
            }
            Err(e) => {
                debug!(follower = %cursor.addr, error = %e, attempt, "sync push failed");
            }
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    warn!(follower = %cursor.addr, "giving up on sync push this tick, will retry on next");
    Ok(())
}

/// Follower side: polls the current leader for anything missed by push, applying ops
/// in order and advancing the persisted cursor as it goes.
pub async fn pull_from_leader(client: &reqwest::Client, db: &DB, leader_addr: &str) -> DirectoryResult<()> {
    let cursor = db.get_sync_cursor()?;
    let url = format!("http://{}/sync?after={}", leader_addr, cursor);

    let resp = match client.get(&url).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            warn!(status = %r.status(), "anti-entropy pull rejected by leader");
            return Ok(());
        }
        Err(e) => {
            debug!(error = %e, "anti-entropy pull failed");
            return Ok(());
        }
    };

    #[derive(Deserialize)]
    struct Entry {
        seq: i64,
        op: SyncOp,
    }
    #[derive(Deserialize)]
    struct Page {
        ops: Vec<Entry>,
    }

    let page: Page = match resp.json().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed anti-entropy response");
            return Ok(());
        }
    };

    for entry in page.ops {
        apply(db, &entry.op)?;
        db.set_sync_cursor(entry.seq)?;
    }

    Ok(())
}
