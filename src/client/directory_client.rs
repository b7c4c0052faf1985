//! Thin HTTP client for talking to a Directory replica, shared by every other
//! component (Store heartbeats and GC, the Replication Manager, the Cache's
//! invalidation source, and the end-user [`crate::client::Client`]).
//!
//! Write operations (`register`, `commit`, `mark_deleted`) are leader-only; if a
//! replica answers `421 Misdirected Request` this client simply tries the next known
//! address, mirroring how a caller is expected to treat the single-writer lease.

use crate::error::{DirectoryError, DirectoryResult};
use crate::types::{MachineId, PhotoId, VolumeId};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    addrs: Vec<String>,
}

#[derive(Serialize)]
struct RegisterRequest {
    size: u64,
}

#[derive(Deserialize)]
pub struct StoreRef {
    pub machine_id: MachineId,
    pub addr: String,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: PhotoId,
    locations: Vec<StoreRef>,
}

#[derive(Serialize)]
struct CommitRequest {
    id: PhotoId,
    cookie: String,
    size: u64,
    checksum: String,
    locations: Vec<(MachineId, VolumeId)>,
}

#[derive(Deserialize)]
struct LocateResponseBody {
    cookie: String,
    size: u64,
    checksum: String,
    replicas: Vec<LocatedReplicaBody>,
}

#[derive(Deserialize)]
struct LocatedReplicaBody {
    machine_id: MachineId,
    addr: String,
    volume_id: VolumeId,
}

pub struct LocatedReplica {
    pub machine_id: MachineId,
    pub addr: String,
    pub volume_id: VolumeId,
}

pub struct LocateInfo {
    pub cookie: crate::types::Cookie,
    pub size: u64,
    pub checksum: Vec<u8>,
    pub replicas: Vec<LocatedReplica>,
}

#[derive(Serialize)]
struct HeartbeatRequest {
    machine_id: MachineId,
    addr: String,
    free_bytes: u64,
    ops_window_60s: u64,
}

#[derive(Deserialize)]
pub struct StoreDescriptorBody {
    pub machine_id: MachineId,
    pub addr: String,
    pub status: String,
    pub free_bytes: u64,
    pub ops_window_60s: u64,
}

impl DirectoryClient {
    pub fn new(addrs: Vec<String>) -> DirectoryClient {
        DirectoryClient {
            http: reqwest::Client::new(),
            addrs,
        }
    }

    /// Tries each known Directory address for a leader-only write, moving to the next
    /// one whenever the current address answers "not the leader" or is unreachable.
    async fn try_each<T, F, Fut>(&self, f: F) -> DirectoryResult<T>
    where
        F: Fn(reqwest::Client, String) -> Fut,
        Fut: std::future::Future<Output = DirectoryResult<T>>,
    {
        let mut last_err = DirectoryError::NotLeader(None);
        for addr in &self.addrs {
            match f(self.http.clone(), addr.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub async fn register(&self, size: u64) -> DirectoryResult<(PhotoId, Vec<StoreRef>)> {
        self.try_each(|http, addr| async move {
            let resp = http
                .post(format!("http://{}/register", addr))
                .json(&RegisterRequest { size })
                .send()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                return Err(DirectoryError::NotLeader(None));
            }
            if !resp.status().is_success() {
                return Err(DirectoryError::Coordination(resp.status().to_string()));
            }

            let body: RegisterResponse = resp
                .json()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;
            Ok((body.id, body.locations))
        })
        .await
    }

    pub async fn commit(
        &self,
        id: PhotoId,
        cookie: &[u8],
        size: u64,
        checksum: &[u8],
        locations: Vec<(MachineId, VolumeId)>,
    ) -> DirectoryResult<()> {
        let cookie = crate::paths::serialize_urlbase64(cookie);
        let checksum = hex_encode(checksum);
        self.try_each(|http, addr| {
            let cookie = cookie.clone();
            let checksum = checksum.clone();
            let locations = locations.clone();
            async move {
                let resp = http
                    .post(format!("http://{}/commit", addr))
                    .json(&CommitRequest { id, cookie, size, checksum, locations })
                    .send()
                    .await
                    .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

                if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                    return Err(DirectoryError::NotLeader(None));
                }
                if !resp.status().is_success() {
                    return Err(DirectoryError::Coordination(resp.status().to_string()));
                }
                Ok(())
            }
        })
        .await
    }

    pub async fn mark_deleted(&self, id: PhotoId) -> DirectoryResult<()> {
        self.try_each(|http, addr| async move {
            let resp = http
                .post(format!("http://{}/mark_deleted", addr))
                .json(&serde_json::json!({ "id": id }))
                .send()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                return Err(DirectoryError::NotLeader(None));
            }
            if !resp.status().is_success() {
                return Err(DirectoryError::Coordination(resp.status().to_string()));
            }
            Ok(())
        })
        .await
    }

    /// `locate` may be answered by any replica; only the first reachable address is
    /// tried since bounded staleness is acceptable here.
    pub async fn locate(&self, id: PhotoId) -> DirectoryResult<LocateInfo> {
        let addr = self.addrs.first().ok_or(DirectoryError::NotFound)?;
        let resp = self
            .http
            .get(format!("http://{}/locate?id={}", addr, id))
            .send()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(DirectoryError::Coordination(resp.status().to_string()));
        }

        let body: LocateResponseBody = resp
            .json()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

        let cookie_bytes = crate::paths::parse_urlbase64(&body.cookie)
            .map_err(|e| DirectoryError::Coordination(format!("malformed cookie in locate response: {}", e)))?;
        let cookie: crate::types::Cookie = cookie_bytes
            .try_into()
            .map_err(|_| DirectoryError::Coordination("locate response cookie has the wrong length".into()))?;
        let checksum = hex_decode(&body.checksum)
            .map_err(|_| DirectoryError::Coordination("malformed checksum in locate response".into()))?;

        Ok(LocateInfo {
            cookie,
            size: body.size,
            checksum,
            replicas: body
                .replicas
                .into_iter()
                .map(|r| LocatedReplica {
                    machine_id: r.machine_id,
                    addr: r.addr,
                    volume_id: r.volume_id,
                })
                .collect(),
        })
    }

    pub async fn heartbeat(&self, machine_id: MachineId, addr: &str, free_bytes: u64, ops_window_60s: u64) -> DirectoryResult<()> {
        for directory_addr in &self.addrs {
            let resp = self
                .http
                .post(format!("http://{}/heartbeat", directory_addr))
                .json(&HeartbeatRequest {
                    machine_id,
                    addr: addr.to_string(),
                    free_bytes,
                    ops_window_60s,
                })
                .send()
                .await;
            if let Ok(r) = resp {
                if r.status().is_success() {
                    return Ok(());
                }
            }
        }
        Err(DirectoryError::Coordination("no directory replica accepted heartbeat".into()))
    }

    /// Fetches the cluster id every Directory replica agrees on, tried against each
    /// known address in turn. A freshly bootstrapped Store calls this once before
    /// opening its first volume.
    pub async fn cluster_id(&self) -> DirectoryResult<u64> {
        for addr in &self.addrs {
            if let Ok(resp) = self.http.get(format!("http://{}/cluster_id", addr)).send().await {
                if resp.status().is_success() {
                    if let Ok(id) = resp.json::<u64>().await {
                        return Ok(id);
                    }
                }
            }
        }
        Err(DirectoryError::Coordination("no directory replica answered cluster_id".into()))
    }

    pub async fn stores(&self) -> DirectoryResult<Vec<StoreDescriptorBody>> {
        let addr = self.addrs.first().ok_or(DirectoryError::NoHealthyStores)?;
        let resp = self
            .http
            .get(format!("http://{}/stores", addr))
            .send()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;
        resp.json().await.map_err(|e| DirectoryError::Coordination(e.to_string()))
    }

    /// Every live photo id currently placed on `machine_id`, for that store's GC.
    pub async fn live_ids_for_store(&self, machine_id: MachineId) -> DirectoryResult<Vec<PhotoId>> {
        let addr = self.addrs.first().ok_or(DirectoryError::NoHealthyStores)?;
        let resp = self
            .http
            .get(format!("http://{}/gc_check?machine_id={}", addr, machine_id))
            .send()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;
        resp.json().await.map_err(|e| DirectoryError::Coordination(e.to_string()))
    }

    /// Raises or lowers a photo's desired replica count; leader-only.
    pub async fn set_desired_replicas(&self, id: PhotoId, desired_replicas: usize) -> DirectoryResult<()> {
        self.try_each(|http, addr| async move {
            let resp = http
                .post(format!("http://{}/set_desired_replicas", addr))
                .json(&serde_json::json!({ "id": id, "desired_replicas": desired_replicas }))
                .send()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                return Err(DirectoryError::NotLeader(None));
            }
            if !resp.status().is_success() {
                return Err(DirectoryError::Coordination(resp.status().to_string()));
            }
            Ok(())
        })
        .await
    }

    /// One page of live photos with their desired vs. actual replica counts, used by
    /// the Replication Manager to find under/over-replicated blobs.
    pub async fn replica_counts(&self, after: PhotoId, limit: i64) -> DirectoryResult<Vec<ReplicaCountEntry>> {
        let addr = self.addrs.first().ok_or(DirectoryError::NoHealthyStores)?;
        let resp = self
            .http
            .get(format!("http://{}/replica_counts?after={}&limit={}", addr, after, limit))
            .send()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;
        resp.json().await.map_err(|e| DirectoryError::Coordination(e.to_string()))
    }

    /// Records a replica that the Replication Manager just created via a Store's
    /// `/copy`; leader-only.
    pub async fn add_location(&self, id: PhotoId, machine_id: MachineId, volume_id: VolumeId) -> DirectoryResult<()> {
        self.try_each(|http, addr| async move {
            let resp = http
                .post(format!("http://{}/add_location", addr))
                .json(&serde_json::json!({ "id": id, "machine_id": machine_id, "volume_id": volume_id }))
                .send()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                return Err(DirectoryError::NotLeader(None));
            }
            if !resp.status().is_success() {
                return Err(DirectoryError::Coordination(resp.status().to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Drops a replica record after the Replication Manager evicts a de-replication
    /// victim; leader-only.
    pub async fn remove_location(&self, id: PhotoId, machine_id: MachineId) -> DirectoryResult<()> {
        self.try_each(|http, addr| async move {
            let resp = http
                .post(format!("http://{}/remove_location", addr))
                .json(&serde_json::json!({ "id": id, "machine_id": machine_id }))
                .send()
                .await
                .map_err(|e| DirectoryError::Coordination(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                return Err(DirectoryError::NotLeader(None));
            }
            if !resp.status().is_success() {
                return Err(DirectoryError::Coordination(resp.status().to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Every store currently holding a replica of `id`, regardless of health.
    pub async fn locations_for_photo(&self, id: PhotoId) -> DirectoryResult<Vec<LocationEntry>> {
        let addr = self.addrs.first().ok_or(DirectoryError::NoHealthyStores)?;
        let resp = self
            .http
            .get(format!("http://{}/locations?id={}", addr, id))
            .send()
            .await
            .map_err(|e| DirectoryError::Coordination(e.to_string()))?;
        resp.json().await.map_err(|e| DirectoryError::Coordination(e.to_string()))
    }
}

#[derive(Deserialize, Clone)]
pub struct ReplicaCountEntry {
    pub id: PhotoId,
    pub desired_replicas: usize,
    pub actual_replicas: usize,
    pub read_rate_60s: u64,
}

#[derive(Deserialize, Clone)]
pub struct LocationEntry {
    pub machine_id: MachineId,
    pub volume_id: VolumeId,
    pub addr: String,
    pub status: String,
    pub free_bytes: u64,
    pub ops_window_60s: u64,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}
