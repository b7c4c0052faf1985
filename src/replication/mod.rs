//! The Replication Manager: watches store health and per-photo replica counts, drives
//! up- and down-replication, adapts desired replica counts to read hotness, and runs
//! the nightly full audit.
//!
//! The teacher has no working code for this role — `pitchfork/mod.rs` sketches the
//! same responsibilities as a block comment of TODOs and is never wired to anything.
//! This module realizes that sketch as a periodic control loop in the same
//! background-task idiom used by the Store's heartbeat and GC workers, guarded by an
//! advisory lock in the coordination store so only one instance acts at a time.

pub mod routes;

use crate::client::directory_client::{DirectoryClient, LocationEntry, ReplicaCountEntry, StoreDescriptorBody};
use crate::client::store_client::StoreClient;
use crate::client::cache_client::CacheClient;
use crate::config::HaystackConfig;
use crate::coordination::Coordinator;
use crate::directory::placement::select_deprec_victim;
use crate::directory::models::StoreMachineRow;
use crate::error::ReplicationResult;
use crate::types::{MachineId, PhotoId};
use chrono::{Timelike, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

const LOCK_KEY: &str = "replication/lock";

/// Snapshot of the most recently completed tick, served by `GET /status`.
#[derive(Clone, Default)]
pub struct TickStats {
    pub tick: u64,
    pub duration_ms: u64,
    pub under_replicated: u64,
    pub over_replicated: u64,
    pub holds_lock: bool,
}

pub struct ReplicationManager {
    directory: DirectoryClient,
    cache: Option<CacheClient>,
    coordinator: Coordinator,
    config: HaystackConfig,
    self_id: String,
    holds_lock: Mutex<bool>,
    last_audit_date: Mutex<Option<chrono::NaiveDate>>,
    tick_count: AtomicU64,
    stats: Mutex<TickStats>,
}

impl ReplicationManager {
    pub fn new(
        directory: DirectoryClient,
        cache: Option<CacheClient>,
        coordinator: Coordinator,
        config: HaystackConfig,
        self_id: String,
    ) -> ReplicationManager {
        ReplicationManager {
            directory,
            cache,
            coordinator,
            config,
            self_id,
            holds_lock: Mutex::new(false),
            last_audit_date: Mutex::new(None),
            tick_count: AtomicU64::new(0),
            stats: Mutex::new(TickStats::default()),
        }
    }

    pub fn stats(&self) -> TickStats {
        self.stats.lock().unwrap().clone()
    }

    /// Tries to become (or remain) the single active Replication Manager instance.
    /// Holding the lock is re-attempted every tick rather than held indefinitely, so a
    /// process that loses Redis connectivity mid-tick cleanly yields to another
    /// instance once its lease lapses.
    async fn acquire_lock(&self) -> bool {
        let already_held = *self.holds_lock.lock().unwrap();
        let ttl = self.config.replication_lock_ttl();

        let ok = if already_held {
            match self.coordinator.refresh(LOCK_KEY, &self.self_id, ttl).await {
                Ok(true) => true,
                _ => self.coordinator.try_acquire(LOCK_KEY, &self.self_id, ttl).await.unwrap_or(false),
            }
        } else {
            self.coordinator.try_acquire(LOCK_KEY, &self.self_id, ttl).await.unwrap_or(false)
        };

        *self.holds_lock.lock().unwrap() = ok;
        ok
    }

    /// One control-loop iteration: the steady-state tick from the per-tick procedure,
    /// run only if this instance currently holds the advisory lock. Also triggers the
    /// nightly full audit once per local calendar day at `nightly_audit_hour`.
    pub async fn run_once(&self) -> ReplicationResult<()> {
        let start = Instant::now();
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.acquire_lock().await {
            let mut stats = self.stats.lock().unwrap();
            stats.tick = tick;
            stats.holds_lock = false;
            return Ok(());
        }

        let now = Utc::now();
        let run_nightly_audit = now.hour() == self.config.nightly_audit_hour && {
            let mut last = self.last_audit_date.lock().unwrap();
            let today = now.date_naive();
            if *last == Some(today) {
                false
            } else {
                *last = Some(today);
                true
            }
        };

        let (under, over) = if run_nightly_audit {
            self.full_audit().await?
        } else {
            self.steady_state_tick().await?
        };

        let mut stats = self.stats.lock().unwrap();
        stats.tick = tick;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats.under_replicated = under;
        stats.over_replicated = over;
        stats.holds_lock = true;
        Ok(())
    }

    /// Samples one page of replica counts and acts on it; the steady-state path named
    /// in the per-tick procedure (as opposed to the nightly full scan).
    async fn steady_state_tick(&self) -> ReplicationResult<(u64, u64)> {
        const PAGE_SIZE: i64 = 500;
        let healthy = self.healthy_set().await?;
        let rows = self.directory.replica_counts(0, PAGE_SIZE).await?;
        self.reconcile_page(&rows, &healthy).await
    }

    /// Scans every live photo record, not just one page, enforcing the same
    /// invariants. Idempotent: safe to interrupt and re-run from the top, since each
    /// page is reconciled independently and a partial run just leaves the remaining
    /// pages for the next nightly audit or steady-state tick to catch.
    async fn full_audit(&self) -> ReplicationResult<(u64, u64)> {
        const PAGE_SIZE: i64 = 1000;
        let healthy = self.healthy_set().await?;
        let mut after: PhotoId = 0;
        let mut total_under = 0u64;
        let mut total_over = 0u64;

        loop {
            let rows = self.directory.replica_counts(after, PAGE_SIZE).await?;
            if rows.is_empty() {
                break;
            }
            after = rows.iter().map(|r| r.id).max().unwrap_or(after);

            let (under, over) = self.reconcile_page(&rows, &healthy).await?;
            total_under += under;
            total_over += over;

            if (rows.len() as i64) < PAGE_SIZE {
                break;
            }
        }

        Ok((total_under, total_over))
    }

    async fn healthy_set(&self) -> ReplicationResult<Vec<StoreDescriptorBody>> {
        Ok(self
            .directory
            .stores()
            .await?
            .into_iter()
            .filter(|s| s.status == "healthy")
            .collect())
    }

    /// Applies the per-tick procedure to one page of replica-count rows: adapts
    /// desired replica counts to hotness, then up- or down-replicates as needed.
    async fn reconcile_page(&self, rows: &[ReplicaCountEntry], healthy: &[StoreDescriptorBody]) -> ReplicationResult<(u64, u64)> {
        let mut under = 0u64;
        let mut over = 0u64;
        let healthy_ids: HashSet<MachineId> = healthy.iter().map(|s| s.machine_id).collect();

        for row in rows {
            self.adapt_desired_replicas(row).await;

            let locations = self.directory.locations_for_photo(row.id).await?;
            let present_healthy: Vec<&LocationEntry> = locations
                .iter()
                .filter(|l| healthy_ids.contains(&l.machine_id))
                .collect();

            if present_healthy.len() < row.desired_replicas {
                under += 1;
                self.up_replicate(row.id, &present_healthy, &locations, healthy).await;
            } else if locations.len() > row.desired_replicas {
                over += 1;
                self.de_replicate(row.id, &locations, row.desired_replicas).await;
            }
        }

        Ok((under, over))
    }

    /// Raises `desired_replicas` towards the configured maximum for hot blobs, and
    /// relaxes it back towards the default for cold ones, resolving the spec's
    /// "60-second read rate exceeds a hotness threshold" rule against the Directory's
    /// locally observed read counter.
    async fn adapt_desired_replicas(&self, row: &ReplicaCountEntry) {
        let hot = row.read_rate_60s >= self.config.hotness_threshold;
        let target = if hot {
            self.config.max_replica_count
        } else {
            self.config.default_replica_count
        };
        if row.desired_replicas != target {
            let _ = self.directory.set_desired_replicas(row.id, target).await;
        }
    }

    /// Step 3 of the per-tick procedure: pick a source from the photo's present
    /// healthy replicas and a destination from the healthy set it isn't on yet, copy,
    /// then record the new location. Aborts silently (leaving metadata untouched) if
    /// no eligible source or destination remains, since the next tick will retry.
    async fn up_replicate(
        &self,
        photo_id: PhotoId,
        present_healthy: &[&LocationEntry],
        all_locations: &[LocationEntry],
        healthy: &[StoreDescriptorBody],
    ) {
        let Some(source) = present_healthy.first() else {
            return;
        };

        let occupied: HashSet<MachineId> = all_locations.iter().map(|l| l.machine_id).collect();
        let candidates: Vec<StoreMachineRow> = healthy
            .iter()
            .filter(|s| !occupied.contains(&s.machine_id))
            .map(descriptor_to_row)
            .collect();

        let chosen = crate::directory::placement::select_stores(&candidates, 1, 0, self.config.placement_margin_bytes);
        let Some(&destination_id) = chosen.first() else {
            return;
        };
        let Some(destination) = healthy.iter().find(|s| s.machine_id == destination_id) else {
            return;
        };

        let store = StoreClient::new(source.addr.clone());
        match store.copy_to(photo_id, &destination.addr).await {
            Ok(volume_id) => {
                let _ = self.directory.add_location(photo_id, destination_id, volume_id).await;
            }
            Err(e) => tracing::warn!(photo_id, destination = %destination.addr, error = %e, "up-replication copy failed"),
        }
    }

    /// Step 4 of the per-tick procedure: drop the busiest excess replica, never below
    /// `desired_replicas`, and invalidate it from the cache since the evicted store
    /// can no longer answer for this blob.
    async fn de_replicate(&self, photo_id: PhotoId, locations: &[LocationEntry], desired_replicas: usize) {
        if locations.len() <= desired_replicas {
            return;
        }

        let rows: Vec<StoreMachineRow> = locations.iter().map(location_to_row).collect();
        let Some(victim_id) = select_deprec_victim(&rows) else {
            return;
        };
        let Some(victim) = locations.iter().find(|l| l.machine_id == victim_id) else {
            return;
        };

        let store = StoreClient::new(victim.addr.clone());
        match store.delete(victim.volume_id, photo_id).await {
            Ok(()) => {
                let _ = self.directory.remove_location(photo_id, victim_id).await;
                if let Some(cache) = &self.cache {
                    cache.invalidate(photo_id).await;
                }
            }
            Err(e) => tracing::warn!(photo_id, victim = %victim.addr, error = %e, "de-replication delete failed"),
        }
    }
}

/// `select_stores`/`select_deprec_victim` are shaped around the Directory's own
/// database row, not the HTTP-level descriptor this process sees over the wire; these
/// adapters carry just the fields the placement policy actually reads.
fn descriptor_to_row(s: &StoreDescriptorBody) -> StoreMachineRow {
    StoreMachineRow {
        id: s.machine_id as i32,
        addr: s.addr.clone(),
        last_heartbeat: Utc::now(),
        free_bytes: s.free_bytes as i64,
        ops_window_60s: s.ops_window_60s as i64,
        status: s.status.clone(),
        write_enabled: true,
    }
}

fn location_to_row(l: &LocationEntry) -> StoreMachineRow {
    StoreMachineRow {
        id: l.machine_id as i32,
        addr: l.addr.clone(),
        last_heartbeat: Utc::now(),
        free_bytes: l.free_bytes as i64,
        ops_window_60s: l.ops_window_60s as i64,
        status: l.status.clone(),
        write_enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(machine_id: MachineId, ops: u64, free: u64) -> StoreDescriptorBody {
        StoreDescriptorBody {
            machine_id,
            addr: format!("127.0.0.1:{}", 9000 + machine_id),
            status: "healthy".to_string(),
            free_bytes: free,
            ops_window_60s: ops,
        }
    }

    #[test]
    fn descriptor_to_row_preserves_placement_fields() {
        let d = descriptor(3, 42, 1_000_000);
        let row = descriptor_to_row(&d);
        assert_eq!(row.id, 3);
        assert_eq!(row.ops_window_60s, 42);
        assert_eq!(row.free_bytes, 1_000_000);
        assert!(row.write_enabled);
    }

    #[test]
    fn location_to_row_preserves_placement_fields() {
        let l = LocationEntry {
            machine_id: 7,
            volume_id: 1,
            addr: "127.0.0.1:9007".to_string(),
            status: "healthy".to_string(),
            free_bytes: 500,
            ops_window_60s: 9,
        };
        let row = location_to_row(&l);
        assert_eq!(row.id, 7);
        assert_eq!(row.free_bytes, 500);
    }
}
