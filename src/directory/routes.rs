//! HTTP surface for the Directory: `/register`, `/commit`, `/locate`, `/mark_deleted`,
//! `/heartbeat`, `/stores`, and the leader/follower `/sync` endpoints.

use crate::directory::sync::{self, SyncOp};
use crate::directory::Directory;
use crate::error::DirectoryError;
use crate::ratelimit::{self, RateLimiter};
use crate::types::{MachineId, PhotoId, VolumeId};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Client-facing write endpoints are rate-limited per source address; heartbeats,
/// reads, and inter-node sync traffic are not.
pub fn router(directory: Arc<Directory>, limiter: RateLimiter) -> Router {
    let write_limit = middleware::from_fn_with_state(limiter, ratelimit::enforce);

    Router::new()
        .route("/register", post(register).route_layer(write_limit.clone()))
        .route("/commit", post(commit).route_layer(write_limit.clone()))
        .route("/locate", get(locate))
        .route("/mark_deleted", post(mark_deleted).route_layer(write_limit.clone()))
        .route("/add_location", post(add_location).route_layer(write_limit.clone()))
        .route("/remove_location", post(remove_location).route_layer(write_limit.clone()))
        .route("/set_desired_replicas", post(set_desired_replicas).route_layer(write_limit))
        .route("/cluster_id", get(cluster_id))
        .route("/heartbeat", post(heartbeat))
        .route("/stores", get(stores))
        .route("/gc_check", get(gc_check))
        .route("/replica_counts", get(replica_counts))
        .route("/locations", get(locations))
        .route("/sync", get(pull_sync).post(push_sync))
        .with_state(directory)
}

impl IntoResponse for DirectoryError {
    fn into_response(self) -> Response {
        let status = match &self {
            DirectoryError::NotFound => StatusCode::NOT_FOUND,
            DirectoryError::NotLeader(_) => StatusCode::MISDIRECTED_REQUEST,
            DirectoryError::NoHealthyStores => StatusCode::SERVICE_UNAVAILABLE,
            DirectoryError::Coordination(_) | DirectoryError::Database(_) | DirectoryError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    size: u64,
}

#[derive(Serialize)]
struct StoreRef {
    machine_id: MachineId,
    addr: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    id: PhotoId,
    locations: Vec<StoreRef>,
}

async fn register(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, DirectoryError> {
    let (id, machine_ids) = dir.register(req.size)?;
    let stores = dir.stores()?;

    let locations = machine_ids
        .into_iter()
        .filter_map(|mid| stores.iter().find(|s| s.machine_id == mid))
        .map(|s| StoreRef {
            machine_id: s.machine_id,
            addr: s.addr.clone(),
        })
        .collect();

    Ok(Json(RegisterResponse { id, locations }))
}

#[derive(Deserialize)]
struct CommitRequest {
    id: PhotoId,
    cookie: String, // url-safe base64, matching the needle cookie encoding
    size: u64,
    checksum: String, // hex-encoded SHA256
    locations: Vec<(MachineId, VolumeId)>,
}

async fn commit(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<CommitRequest>,
) -> Result<StatusCode, DirectoryError> {
    let cookie = crate::paths::parse_urlbase64(&req.cookie)
        .map_err(|_| DirectoryError::Database("malformed cookie".into()))?;
    let checksum = hex_decode(&req.checksum).map_err(|_| DirectoryError::Database("malformed checksum".into()))?;
    dir.commit(req.id, &cookie, req.size, &checksum, req.locations)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SetDesiredReplicasRequest {
    id: PhotoId,
    desired_replicas: usize,
}

async fn set_desired_replicas(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<SetDesiredReplicasRequest>,
) -> Result<StatusCode, DirectoryError> {
    dir.set_desired_replicas(req.id, req.desired_replicas)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct AddLocationRequest {
    id: PhotoId,
    machine_id: MachineId,
    volume_id: VolumeId,
}

/// Called by the Replication Manager once a `copy` it issued against a peer Store has
/// actually landed, to record the new replica.
async fn add_location(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<AddLocationRequest>,
) -> Result<StatusCode, DirectoryError> {
    dir.add_location(req.id, req.machine_id, req.volume_id)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct RemoveLocationRequest {
    id: PhotoId,
    machine_id: MachineId,
}

/// Called by the Replication Manager after evicting a de-replication victim.
async fn remove_location(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<RemoveLocationRequest>,
) -> Result<StatusCode, DirectoryError> {
    dir.remove_location(req.id, req.machine_id)?;
    Ok(StatusCode::OK)
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


#[derive(Deserialize)]
struct LocateQuery {
    id: PhotoId,
}

#[derive(Serialize)]
struct LocatedReplicaBody {
    machine_id: MachineId,
    addr: String,
    volume_id: VolumeId,
}

#[derive(Serialize)]
struct LocateResponse {
    cookie: String,   // url-safe base64
    size: u64,
    checksum: String, // hex-encoded SHA256
    replicas: Vec<LocatedReplicaBody>,
}

async fn locate(
    State(dir): State<Arc<Directory>>,
    Query(q): Query<LocateQuery>,
) -> Result<Json<LocateResponse>, DirectoryError> {
    let result = dir.locate(q.id)?;
    Ok(Json(LocateResponse {
        cookie: crate::paths::serialize_urlbase64(&result.cookie),
        size: result.size,
        checksum: hex_encode(&result.checksum),
        replicas: result
            .replicas
            .into_iter()
            .map(|r| LocatedReplicaBody {
                machine_id: r.store.machine_id,
                addr: r.store.addr,
                volume_id: r.volume_id,
            })
            .collect(),
    }))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Deserialize)]
struct MarkDeletedRequest {
    id: PhotoId,
}

async fn mark_deleted(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<MarkDeletedRequest>,
) -> Result<StatusCode, DirectoryError> {
    dir.mark_deleted(req.id)?;
    Ok(StatusCode::OK)
}

/// A freshly bootstrapped Store fetches this before it can open its first volume, so
/// it never invents its own cluster id out of thin air.
async fn cluster_id(State(dir): State<Arc<Directory>>) -> Result<Json<u64>, DirectoryError> {
    Ok(Json(dir.cluster_id()?))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    machine_id: MachineId,
    addr: String,
    free_bytes: u64,
    ops_window_60s: u64,
}

async fn heartbeat(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, DirectoryError> {
    dir.register_store(req.machine_id, &req.addr)?;
    dir.heartbeat(req.machine_id, req.free_bytes, req.ops_window_60s)?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct StoreDescriptorBody {
    machine_id: MachineId,
    addr: String,
    status: &'static str,
    free_bytes: u64,
    ops_window_60s: u64,
}

async fn stores(State(dir): State<Arc<Directory>>) -> Result<Json<Vec<StoreDescriptorBody>>, DirectoryError> {
    let out = dir
        .stores()?
        .into_iter()
        .map(|s| StoreDescriptorBody {
            machine_id: s.machine_id,
            addr: s.addr,
            status: crate::directory::models::status_str(s.status),
            free_bytes: s.free_bytes,
            ops_window_60s: s.ops_window_60s,
        })
        .collect();
    Ok(Json(out))
}

#[derive(Deserialize)]
struct GcCheckQuery {
    machine_id: MachineId,
}

async fn gc_check(
    State(dir): State<Arc<Directory>>,
    Query(q): Query<GcCheckQuery>,
) -> Result<Json<Vec<PhotoId>>, DirectoryError> {
    Ok(Json(dir.db().live_photo_ids_for_store(q.machine_id)?))
}

#[derive(Deserialize)]
struct ReplicaCountsQuery {
    after: PhotoId,
    limit: i64,
}

#[derive(Serialize)]
struct ReplicaCountEntry {
    id: PhotoId,
    desired_replicas: usize,
    actual_replicas: usize,
    read_rate_60s: u64,
}

/// One page of live photos with their desired vs. actual replica counts and this
/// replica's observed read rate, for the Replication Manager's steady-state tick and
/// nightly full audit.
async fn replica_counts(
    State(dir): State<Arc<Directory>>,
    Query(q): Query<ReplicaCountsQuery>,
) -> Result<Json<Vec<ReplicaCountEntry>>, DirectoryError> {
    let rows = dir.photo_replica_counts(q.after, q.limit)?;
    Ok(Json(
        rows.into_iter()
            .map(|(id, desired_replicas, actual_replicas, read_rate_60s)| ReplicaCountEntry {
                id,
                desired_replicas,
                actual_replicas,
                read_rate_60s,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct LocationsQuery {
    id: PhotoId,
}

#[derive(Serialize)]
struct LocationEntry {
    machine_id: MachineId,
    volume_id: VolumeId,
    addr: String,
    status: &'static str,
    free_bytes: u64,
    ops_window_60s: u64,
}

/// Every store currently holding a replica of a photo, regardless of health — used
/// by the Replication Manager, which filters by its own observed healthy set.
async fn locations(
    State(dir): State<Arc<Directory>>,
    Query(q): Query<LocationsQuery>,
) -> Result<Json<Vec<LocationEntry>>, DirectoryError> {
    let rows = dir.locations_with_stores(q.id)?;
    Ok(Json(
        rows.into_iter()
            .map(|(volume_id, s)| LocationEntry {
                machine_id: s.machine_id,
                volume_id,
                addr: s.addr,
                status: crate::directory::models::status_str(s.status),
                free_bytes: s.free_bytes,
                ops_window_60s: s.ops_window_60s,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct AfterQuery {
    after: i64,
}

#[derive(Serialize)]
struct SyncEntry {
    seq: i64,
    op: SyncOp,
}

#[derive(Serialize)]
struct SyncPage {
    ops: Vec<SyncEntry>,
}

async fn pull_sync(
    State(dir): State<Arc<Directory>>,
    Query(q): Query<AfterQuery>,
) -> Result<Json<SyncPage>, DirectoryError> {
    let rows = dir.db().sync_ops_after(q.after, 1000)?;
    let ops = rows
        .into_iter()
        .filter_map(|(seq, op_json)| serde_json::from_str::<SyncOp>(&op_json).ok().map(|op| SyncEntry { seq, op }))
        .collect();
    Ok(Json(SyncPage { ops }))
}

#[derive(Deserialize)]
struct PushedOp {
    seq: i64,
    op: Option<SyncOp>,
}

#[derive(Deserialize)]
struct PushSyncRequest {
    ops: Vec<PushedOp>,
}

async fn push_sync(
    State(dir): State<Arc<Directory>>,
    Json(req): Json<PushSyncRequest>,
) -> Result<StatusCode, DirectoryError> {
    for entry in req.ops {
        if let Some(op) = entry.op {
            sync::apply(dir.db(), &op)?;
            dir.db().set_sync_cursor(entry.seq)?;
        }
    }
    Ok(StatusCode::OK)
}
