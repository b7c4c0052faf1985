//! Owns every volume held by one Store process: which are sealed, which one (if any)
//! is still accepting writes, and the on-disk index of volume ids that survives a
//! restart.
//!
//! Grounded in the teacher's `store/machine.rs` (`HaystackVolumesIndex` framing,
//! exclusive lockfile via `fs2`, `open_volume`/`create_volume`), generalized so the
//! Store itself chooses and seals its active volume instead of waiting for an
//! operator to `POST /volume/<id>` explicitly.

use crate::error::{StoreError, StoreResult};
use crate::store::volume::PhysicalVolume;
use crate::types::{ClusterId, Cookie, MachineId, PhotoId, VolumeId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const VOLUMES_INDEX_MAGIC: &[u8; 4] = b"HAYV";
const VOLUMES_INDEX_HEADER_SIZE: usize = 4 + 4 + 8 + 4; // magic + version + cluster_id + machine_id
const FORMAT_VERSION: u32 = 1;

/// Append-only file listing every volume id this store has ever created, plus which
/// one (if any) is still the active write target. Surviving this file across restarts
/// is what lets the store rebuild its volume set without asking the Directory.
struct VolumesIndex {
    cluster_id: ClusterId,
    machine_id: MachineId,
    file: File,
}

impl VolumesIndex {
    fn create(path: &Path, cluster_id: ClusterId, machine_id: MachineId) -> StoreResult<VolumesIndex> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        file.write_all(VOLUMES_INDEX_MAGIC)?;
        file.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        file.write_u64::<LittleEndian>(cluster_id)?;
        file.write_u32::<LittleEndian>(machine_id)?;
        file.flush()?;
        file.sync_all()?;

        Ok(VolumesIndex {
            cluster_id,
            machine_id,
            file,
        })
    }

    fn open(path: &Path) -> StoreResult<VolumesIndex> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; VOLUMES_INDEX_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[0..4] != VOLUMES_INDEX_MAGIC {
            return Err(StoreError::Corrupt("volumes index magic mismatch".into()));
        }

        let mut cursor = Cursor::new(&header[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupt("volumes index has unknown version".into()));
        }
        let cluster_id = cursor.read_u64::<LittleEndian>()?;
        let machine_id = cursor.read_u32::<LittleEndian>()?;

        Ok(VolumesIndex {
            cluster_id,
            machine_id,
            file,
        })
    }

    fn read_all(&mut self) -> StoreResult<Vec<VolumeId>> {
        self.file.seek(SeekFrom::Start(VOLUMES_INDEX_HEADER_SIZE as u64))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        if buf.len() % 4 != 0 {
            return Err(StoreError::Corrupt("volumes index body is misaligned".into()));
        }
        let mut out = Vec::new();
        let mut cursor = Cursor::new(buf);
        for _ in 0..(cursor.get_ref().len() / 4) {
            out.push(cursor.read_u32::<LittleEndian>()?);
        }
        Ok(out)
    }

    fn add_volume_id(&mut self, id: VolumeId) -> StoreResult<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_u32::<LittleEndian>(id)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Tracks operation timestamps over a sliding window, used to report `ops_window_60s`
/// to the Directory for placement and de-replication decisions.
struct OpsWindow {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl OpsWindow {
    fn new(window: Duration) -> OpsWindow {
        OpsWindow {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self) {
        let mut events = self.events.lock().unwrap();
        events.push_back(Instant::now());
    }

    fn count(&self) -> u64 {
        let cutoff = Instant::now() - self.window;
        let mut events = self.events.lock().unwrap();
        while matches!(events.front(), Some(t) if *t < cutoff) {
            events.pop_front();
        }
        events.len() as u64
    }
}

pub struct VolumeStats {
    pub volume_id: VolumeId,
    pub sealed: bool,
    pub num_needles: usize,
    pub volume_bytes: u64,
    pub live_bytes: u64,
}

pub struct StoreStats {
    pub machine_id: MachineId,
    pub free_bytes: u64,
    pub ops_window_60s: u64,
    pub volumes: Vec<VolumeStats>,
}

/// Encapsulates the full on-disk state of a single Store process: its lockfile (so two
/// processes can never share a directory), its volume index, and the live, opened
/// volumes.
pub struct StoreMachine {
    machine_id: MachineId,
    cluster_id: ClusterId,
    volumes_dir: PathBuf,
    max_volume_size: u64,

    _lockfile: File,
    index: Mutex<VolumesIndex>,

    volumes: Mutex<HashMap<VolumeId, PhysicalVolume>>,
    active_volume_id: AtomicU64,
    next_volume_id: AtomicU64,

    ops: OpsWindow,
}

impl StoreMachine {
    /// Opens (or bootstraps) a store machine rooted at `dir`, replaying every volume
    /// listed in its index.
    pub fn load(
        dir: &Path,
        cluster_id: ClusterId,
        machine_id: MachineId,
        max_volume_size: u64,
    ) -> StoreResult<StoreMachine> {
        std::fs::create_dir_all(dir)?;

        let lockfile = OpenOptions::new()
            .write(true)
            .create(true)
            .open(dir.join("lock"))?;
        lockfile.try_lock_exclusive().map_err(|_| {
            StoreError::BadRequest(format!(
                "another process already holds the lock on {}",
                dir.display()
            ))
        })?;

        let index_path = dir.join("volumes");
        let mut index = if index_path.exists() {
            VolumesIndex::open(&index_path)?
        } else {
            VolumesIndex::create(&index_path, cluster_id, machine_id)?
        };

        if index.cluster_id != cluster_id || index.machine_id != machine_id {
            return Err(StoreError::Corrupt(
                "volumes index belongs to a different cluster or machine id".into(),
            ));
        }

        let mut volumes = HashMap::new();
        let mut max_seen = 0u64;
        for volume_id in index.read_all()? {
            let path = volume_path(dir, volume_id);
            let vol = PhysicalVolume::open(&path)?;
            max_seen = max_seen.max(volume_id as u64);
            volumes.insert(volume_id, vol);
        }

        // Find an existing volume with room to spare so we don't seal a perfectly good
        // volume on every restart.
        let active_volume_id = volumes
            .iter()
            .find(|(_, v)| v.volume_bytes() < max_volume_size)
            .map(|(id, _)| *id)
            .unwrap_or(0);

        Ok(StoreMachine {
            machine_id,
            cluster_id,
            volumes_dir: dir.to_path_buf(),
            max_volume_size,
            _lockfile: lockfile,
            index: Mutex::new(index),
            volumes: Mutex::new(volumes),
            active_volume_id: AtomicU64::new(active_volume_id),
            next_volume_id: AtomicU64::new(max_seen + 1),
            ops: OpsWindow::new(Duration::from_secs(60)),
        })
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    fn create_volume(&self, volume_id: VolumeId) -> StoreResult<()> {
        let path = volume_path(&self.volumes_dir, volume_id);
        let vol = PhysicalVolume::create(&path, self.cluster_id, self.machine_id, volume_id)?;

        self.index.lock().unwrap().add_volume_id(volume_id)?;
        self.volumes.lock().unwrap().insert(volume_id, vol);
        Ok(())
    }

    /// Returns the volume id currently accepting new photo ids, sealing the previous
    /// one and minting a fresh volume if needed.
    fn active_volume(&self) -> StoreResult<VolumeId> {
        let current = self.active_volume_id.load(Ordering::SeqCst) as VolumeId;

        let needs_new = {
            let volumes = self.volumes.lock().unwrap();
            match volumes.get(&current) {
                Some(v) => v.volume_bytes() >= self.max_volume_size,
                None => true,
            }
        };

        if !needs_new {
            return Ok(current);
        }

        let new_id = self.next_volume_id.fetch_add(1, Ordering::SeqCst) as VolumeId;
        self.create_volume(new_id)?;
        self.active_volume_id.store(new_id as u64, Ordering::SeqCst);
        Ok(new_id)
    }

    /// Writes a new needle, choosing the active volume automatically. Returns the
    /// volume id it landed in, which the Directory records alongside the photo id.
    pub fn put(&self, photo_id: PhotoId, cookie: &Cookie, payload: &[u8]) -> StoreResult<VolumeId> {
        let volume_id = self.active_volume()?;
        self.ops.record();

        let volumes = self.volumes.lock().unwrap();
        let vol = volumes.get(&volume_id).ok_or(StoreError::NoSuchVolume(volume_id))?;
        vol.append_needle(photo_id, cookie, payload)?;
        Ok(volume_id)
    }

    /// Writes a needle into a specific, already-known volume. Used by the replication
    /// pipeline when copying an existing photo onto this store.
    pub fn put_into(
        &self,
        volume_id: VolumeId,
        photo_id: PhotoId,
        cookie: &Cookie,
        payload: &[u8],
    ) -> StoreResult<()> {
        self.ops.record();
        let volumes = self.volumes.lock().unwrap();
        match volumes.get(&volume_id) {
            Some(vol) => vol.append_needle(photo_id, cookie, payload),
            None => {
                drop(volumes);
                self.create_volume(volume_id)?;
                let volumes = self.volumes.lock().unwrap();
                volumes
                    .get(&volume_id)
                    .ok_or(StoreError::NoSuchVolume(volume_id))?
                    .append_needle(photo_id, cookie, payload)
            }
        }
    }

    /// Returns the needle's cookie alongside its payload, so callers can enforce the
    /// unguessable-URL contract without a second disk read.
    pub fn get(&self, volume_id: VolumeId, photo_id: PhotoId) -> StoreResult<Option<(Cookie, Vec<u8>)>> {
        self.ops.record();
        let volumes = self.volumes.lock().unwrap();
        let vol = volumes.get(&volume_id).ok_or(StoreError::NoSuchVolume(volume_id))?;
        Ok(vol
            .read_needle(photo_id)?
            .map(|n| (n.header.cookie, n.data().to_vec())))
    }

    pub fn delete(&self, volume_id: VolumeId, photo_id: PhotoId) -> StoreResult<()> {
        self.ops.record();
        let volumes = self.volumes.lock().unwrap();
        let vol = volumes.get(&volume_id).ok_or(StoreError::NoSuchVolume(volume_id))?;
        vol.delete_needle(photo_id)
    }

    /// Finds the volume holding a live copy of `photo_id`, if any is held on this
    /// store. Used by `copy_to` when the caller (the Replication Manager) knows only
    /// the photo id, not which local volume it landed in.
    pub fn find_volume_for(&self, photo_id: PhotoId) -> Option<VolumeId> {
        let volumes = self.volumes.lock().unwrap();
        volumes
            .iter()
            .find(|(_, v)| v.is_live(photo_id))
            .map(|(id, _)| *id)
    }

    pub fn ops_window_60s(&self) -> u64 {
        self.ops.count()
    }

    pub fn free_bytes(&self) -> u64 {
        fs2::available_space(&self.volumes_dir).unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let active = self.active_volume_id.load(Ordering::SeqCst) as VolumeId;
        let volumes = self.volumes.lock().unwrap();
        let volume_stats = volumes
            .iter()
            .map(|(id, v)| VolumeStats {
                volume_id: *id,
                sealed: *id != active,
                num_needles: v.num_needles(),
                volume_bytes: v.volume_bytes(),
                live_bytes: v.live_bytes(),
            })
            .collect();

        StoreStats {
            machine_id: self.machine_id,
            free_bytes: self.free_bytes(),
            ops_window_60s: self.ops_window_60s(),
            volumes: volume_stats,
        }
    }

    /// Volume ids eligible for compaction: sealed and under the efficiency threshold.
    pub fn compaction_candidates(&self, efficiency_threshold: f64) -> Vec<VolumeId> {
        let active = self.active_volume_id.load(Ordering::SeqCst) as VolumeId;
        let volumes = self.volumes.lock().unwrap();
        volumes
            .iter()
            .filter(|(id, v)| **id != active && v.live_fraction() < efficiency_threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Atomically replaces `volume_id`'s on-disk file with a compacted one. The old
    /// file is only unlinked after the new file is durable and swapped into the map.
    pub fn compact_volume(&self, volume_id: VolumeId) -> StoreResult<()> {
        let tmp_path = volume_path(&self.volumes_dir, volume_id).with_extension("compact");
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        let compacted = {
            let volumes = self.volumes.lock().unwrap();
            let vol = volumes.get(&volume_id).ok_or(StoreError::NoSuchVolume(volume_id))?;
            vol.compact_into(&tmp_path)?
        };

        let final_path = volume_path(&self.volumes_dir, volume_id);
        std::fs::rename(&tmp_path, &final_path)?;

        self.volumes.lock().unwrap().insert(volume_id, compacted);
        Ok(())
    }

    /// Every (volume_id, photo_id) pair known on disk, for the garbage collector to
    /// diff against the Directory's live set.
    pub fn all_known_ids(&self) -> Vec<(VolumeId, PhotoId)> {
        let volumes = self.volumes.lock().unwrap();
        volumes
            .iter()
            .flat_map(|(vol_id, v)| v.known_ids().into_iter().map(move |pid| (*vol_id, pid)))
            .collect()
    }
}

fn volume_path(dir: &Path, volume_id: VolumeId) -> PathBuf {
    dir.join(format!("haystack_{}", volume_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_seals_volume_once_max_size_reached() {
        let dir = tempdir().unwrap();
        let machine = StoreMachine::load(dir.path(), 1, 1, 200).unwrap();

        let cookie = [0u8; 16];
        let first = machine.put(1, &cookie, &vec![0u8; 50]).unwrap();
        let second = machine.put(2, &cookie, &vec![0u8; 200]).unwrap();

        assert_eq!(first, second, "second put should still land in the same, not-yet-full volume");

        let third = machine.put(3, &cookie, &vec![0u8; 10]).unwrap();
        assert_ne!(third, second, "once the active volume exceeds its cap, a new one should be sealed in");
    }

    #[test]
    fn stats_reports_free_bytes_and_ops() {
        let dir = tempdir().unwrap();
        let machine = StoreMachine::load(dir.path(), 1, 7, 1 << 20).unwrap();
        machine.put(1, &[0u8; 16], b"abc").unwrap();

        let stats = machine.stats();
        assert_eq!(stats.machine_id, 7);
        assert_eq!(stats.ops_window_60s, 1);
        assert_eq!(stats.volumes.len(), 1);
    }

    #[test]
    fn reopening_replays_existing_volumes() {
        let dir = tempdir().unwrap();
        {
            let machine = StoreMachine::load(dir.path(), 1, 1, 1 << 20).unwrap();
            machine.put(1, &[0u8; 16], b"hello").unwrap();
        }

        let reopened = StoreMachine::load(dir.path(), 1, 1, 1 << 20).unwrap();
        let vol_id = reopened.stats().volumes[0].volume_id;
        assert_eq!(reopened.get(vol_id, 1).unwrap().unwrap().1, b"hello");
    }
}
