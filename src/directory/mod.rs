//! The Directory: metadata authority, leader election, placement policy, and
//! push-based replication to followers.

pub mod db;
pub mod election;
pub mod health;
pub mod models;
pub mod placement;
pub mod routes;
pub mod schema;
pub mod sync;

use crate::config::HaystackConfig;
use crate::directory::db::DB;
use crate::directory::election::LeaderElection;
use crate::directory::sync::{FollowerCursor, SyncOp};
use crate::error::{DirectoryError, DirectoryResult};
use crate::types::{ClusterId, MachineId, MachineStatus, PhotoId, VolumeId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A per-photo 60-second read counter, the same sliding-window shape as the Store's
/// `ops_window_60s`, feeding the Replication Manager's hotness check.
struct ReadWindow {
    events: Mutex<VecDeque<Instant>>,
}

impl ReadWindow {
    fn new() -> ReadWindow {
        ReadWindow {
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self) {
        self.events.lock().unwrap().push_back(Instant::now());
    }

    fn count(&self, window: Duration) -> u64 {
        let cutoff = Instant::now() - window;
        let mut events = self.events.lock().unwrap();
        while matches!(events.front(), Some(t) if *t < cutoff) {
            events.pop_front();
        }
        events.len() as u64
    }
}

pub struct StoreDescriptor {
    pub machine_id: MachineId,
    pub addr: String,
    pub status: MachineStatus,
    pub free_bytes: u64,
    pub ops_window_60s: u64,
}

/// A single healthy replica of a photo, as returned by `locate`: enough for a reader
/// to go straight to `GET /needle/<volume_id>/<photo_id>?cookie=` without a second
/// round trip to discover which volume it landed in.
pub struct LocatedReplica {
    pub store: StoreDescriptor,
    pub volume_id: VolumeId,
}

pub struct LocateResult {
    pub cookie: Vec<u8>,
    pub size: u64,
    pub checksum: Vec<u8>,
    pub replicas: Vec<LocatedReplica>,
}

/// Ties together the local metadata database, this replica's leader-election state,
/// and its HTTP client for talking to peers and stores.
pub struct Directory {
    db: DB,
    election: LeaderElection,
    config: HaystackConfig,
    http: reqwest::Client,
    followers: Mutex<Vec<FollowerCursor>>,
    reads: DashMap<PhotoId, ReadWindow>,
}

impl Directory {
    pub fn new(db: DB, election: LeaderElection, config: HaystackConfig) -> Directory {
        let followers = config
            .directory_peers
            .iter()
            .map(|addr| FollowerCursor {
                addr: addr.clone(),
                last_acked: 0,
            })
            .collect();

        Directory {
            db,
            election,
            config,
            http: reqwest::Client::new(),
            followers: Mutex::new(followers),
            reads: DashMap::new(),
        }
    }

    pub fn db(&self) -> &DB {
        &self.db
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    pub fn config(&self) -> &HaystackConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    fn require_leader(&self) -> DirectoryResult<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(DirectoryError::NotLeader(None))
        }
    }

    pub fn cluster_id(&self) -> DirectoryResult<ClusterId> {
        self.db.get_or_create_cluster_id()
    }

    /// `register`: allocates an id and picks placement, but writes nothing to the
    /// metadata table yet — the caller commits once bytes actually land on disk.
    pub fn register(&self, size: u64) -> DirectoryResult<(PhotoId, Vec<MachineId>)> {
        self.require_leader()?;

        let id = self.db.allocate_photo_id()?;
        let candidates = self.db.list_stores()?;
        let chosen = crate::directory::placement::select_stores(
            &candidates,
            self.config.default_replica_count,
            size,
            self.config.placement_margin_bytes,
        );

        if chosen.is_empty() {
            return Err(DirectoryError::NoHealthyStores);
        }

        Ok((id, chosen))
    }

    /// `commit`: persists the photo record and its actually-written locations, then
    /// logs the mutation for follower push.
    pub fn commit(
        &self,
        photo_id: PhotoId,
        cookie: &[u8],
        size: u64,
        checksum: &[u8],
        locations: Vec<(MachineId, VolumeId)>,
    ) -> DirectoryResult<()> {
        self.require_leader()?;

        self.db.commit_photo(
            photo_id,
            cookie,
            size,
            checksum,
            self.config.default_replica_count,
            &locations,
        )?;
        sync::log(
            &self.db,
            &SyncOp::CommitPhoto {
                photo_id,
                cookie: cookie.to_vec(),
                size,
                checksum: checksum.to_vec(),
                desired_replicas: self.config.default_replica_count,
                locations,
            },
        )?;
        Ok(())
    }

    pub fn mark_deleted(&self, photo_id: PhotoId) -> DirectoryResult<()> {
        self.require_leader()?;
        self.db.mark_deleted(photo_id)?;
        sync::log(&self.db, &SyncOp::MarkDeleted { photo_id })?;
        Ok(())
    }

    /// Raises or lowers a photo's desired replica count in response to its recent read
    /// rate, clamped to `[default_replica_count, max_replica_count]`. Leader-only, like
    /// every other metadata mutation.
    pub fn set_desired_replicas(&self, photo_id: PhotoId, desired: usize) -> DirectoryResult<()> {
        self.require_leader()?;
        let clamped = desired
            .max(self.config.default_replica_count)
            .min(self.config.max_replica_count);
        self.db.set_desired_replicas(photo_id, clamped)?;
        sync::log(
            &self.db,
            &SyncOp::SetDesiredReplicas {
                photo_id,
                desired_replicas: clamped,
            },
        )?;
        Ok(())
    }

    /// One page of live photos with their desired and actual replica counts, plus this
    /// replica's observed read rate, for the Replication Manager's steady-state ticks
    /// and nightly full audit.
    pub fn photo_replica_counts(&self, after: PhotoId, limit: i64) -> DirectoryResult<Vec<(PhotoId, usize, usize, u64)>> {
        Ok(self
            .db
            .photo_replica_counts(after, limit)?
            .into_iter()
            .map(|(id, desired, actual)| (id, desired as usize, actual as usize, self.read_rate_60s(id)))
            .collect())
    }

    /// Every store currently holding a replica of `photo_id`, regardless of health —
    /// the Replication Manager itself filters by the healthy set `H`.
    pub fn locations_with_stores(&self, photo_id: PhotoId) -> DirectoryResult<Vec<(VolumeId, StoreDescriptor)>> {
        Ok(self
            .db
            .locations_with_stores(photo_id)?
            .into_iter()
            .map(|(volume_id, s)| {
                (
                    volume_id,
                    StoreDescriptor {
                        machine_id: s.id as MachineId,
                        addr: s.addr,
                        status: s.parsed_status(),
                        free_bytes: s.free_bytes as u64,
                        ops_window_60s: s.ops_window_60s as u64,
                    },
                )
            })
            .collect())
    }

    pub fn add_location(&self, photo_id: PhotoId, machine_id: MachineId, volume_id: VolumeId) -> DirectoryResult<()> {
        self.require_leader()?;
        self.db.add_location(photo_id, machine_id, volume_id)?;
        sync::log(&self.db, &SyncOp::AddLocation { photo_id, machine_id, volume_id })?;
        Ok(())
    }

    pub fn remove_location(&self, photo_id: PhotoId, machine_id: MachineId) -> DirectoryResult<()> {
        self.require_leader()?;
        self.db.remove_location(photo_id, machine_id)?;
        sync::log(&self.db, &SyncOp::RemoveLocation { photo_id, machine_id })?;
        Ok(())
    }

    /// Reads/60s observed for a photo on this replica. Each Directory replica tracks
    /// its own read traffic independently; the Replication Manager only needs an
    /// approximate signal to decide hotness, not a cluster-wide exact count.
    pub fn read_rate_60s(&self, photo_id: PhotoId) -> u64 {
        self.reads
            .get(&photo_id)
            .map(|w| w.count(Duration::from_secs(60)))
            .unwrap_or(0)
    }

    /// Drops read-rate counters that have gone fully idle, so a long-running Directory
    /// process doesn't accumulate one entry per ever-requested photo forever.
    pub fn sweep_read_windows(&self) {
        self.reads.retain(|_, w| w.count(Duration::from_secs(60)) > 0);
    }

    /// `locate`: any replica answers, filtered down to healthy-looking stores. Every
    /// call counts towards the photo's 60-second read rate, which the Replication
    /// Manager uses to decide whether to raise `desired_replicas`.
    pub fn locate(&self, photo_id: PhotoId) -> DirectoryResult<LocateResult> {
        self.reads.entry(photo_id).or_insert_with(ReadWindow::new).record();

        let photo = self.db.get_photo(photo_id)?.ok_or(DirectoryError::NotFound)?;
        if photo.deleted {
            return Err(DirectoryError::NotFound);
        }

        let locations = self.db.locations_for_photo(photo_id)?;
        let mut replicas = Vec::new();
        for loc in locations {
            if let Some(store) = self.db.get_store(loc.machine_id as MachineId)? {
                if store.parsed_status().is_healthy() {
                    replicas.push(LocatedReplica {
                        store: StoreDescriptor {
                            machine_id: store.id as MachineId,
                            addr: store.addr,
                            status: store.parsed_status(),
                            free_bytes: store.free_bytes as u64,
                            ops_window_60s: store.ops_window_60s as u64,
                        },
                        volume_id: loc.volume_id as VolumeId,
                    });
                }
            }
        }

        if replicas.is_empty() {
            return Err(DirectoryError::NotFound);
        }
        Ok(LocateResult {
            cookie: photo.cookie,
            size: photo.size as u64,
            checksum: photo.checksum,
            replicas,
        })
    }

    pub fn register_store(&self, machine_id: MachineId, addr: &str) -> DirectoryResult<()> {
        self.db.register_store(machine_id, addr)?;
        if self.is_leader() {
            sync::log(
                &self.db,
                &SyncOp::RegisterStore {
                    machine_id,
                    addr: addr.to_string(),
                },
            )?;
        }
        Ok(())
    }

    pub fn heartbeat(&self, machine_id: MachineId, free_bytes: u64, ops_window_60s: u64) -> DirectoryResult<()> {
        self.db.heartbeat_store(machine_id, free_bytes, ops_window_60s)
    }

    pub fn stores(&self) -> DirectoryResult<Vec<StoreDescriptor>> {
        Ok(self
            .db
            .list_stores()?
            .into_iter()
            .map(|s| StoreDescriptor {
                machine_id: s.id as MachineId,
                addr: s.addr.clone(),
                status: s.parsed_status(),
                free_bytes: s.free_bytes as u64,
                ops_window_60s: s.ops_window_60s as u64,
            })
            .collect())
    }

    /// One leader-side push tick: forwards new log entries to every follower.
    pub async fn push_to_followers(&self) {
        if !self.is_leader() {
            return;
        }

        let mut cursors = {
            let guard = self.followers.lock().unwrap();
            guard.iter().map(|c| FollowerCursor { addr: c.addr.clone(), last_acked: c.last_acked }).collect::<Vec<_>>()
        };

        for cursor in cursors.iter_mut() {
            let _ = sync::push_to_follower(&self.http, &self.db, cursor).await;
        }

        let mut guard = self.followers.lock().unwrap();
        *guard = cursors;
    }

    /// One follower-side anti-entropy tick: pulls anything missed from the current
    /// leader.
    pub async fn pull_from_leader(&self) {
        if self.is_leader() {
            return;
        }
        if let Some(leader_addr) = self.election.current_leader().await {
            let _ = sync::pull_from_leader(&self.http, &self.db, &leader_addr).await;
        }
    }

    pub fn run_health_scan(&self) -> DirectoryResult<()> {
        if !self.is_leader() {
            return Ok(());
        }
        health::run_once(&self.db, self.config.health_window())
    }
}
