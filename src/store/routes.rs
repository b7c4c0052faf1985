//! The Store's HTTP surface: write a needle into the active volume, read or delete a
//! needle from a known volume, and report per-volume stats.
//!
//! Grounded in the teacher's `store/routes.rs` (one route per needle operation, a
//! cookie checked against the needle's own header when present), ported from Rocket
//! handlers to axum and generalized so the Store itself chooses the active volume
//! instead of the caller naming one for every write.

use crate::error::StoreError;
use crate::paths::CookieBuf;
use crate::ratelimit::{self, RateLimiter};
use crate::store::machine::StoreStats;
use crate::store::StoreContext;
use crate::types::{PhotoId, VolumeId};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Write endpoints (`put`, `delete`, `copy`) are rate-limited per source address;
/// `get` and `stats` are not, matching the spec's "write endpoints" scope. `delete`
/// shares a path with `get`, so it is limited from inside the handler rather than via
/// a route-wide layer, which would also catch reads.
pub fn router(ctx: Arc<StoreContext>, limiter: RateLimiter) -> Router {
    let write_limit = middleware::from_fn_with_state(limiter.clone(), ratelimit::enforce);

    Router::new()
        .route("/needle/:photo_id", put(put_needle).route_layer(write_limit.clone()))
        .route("/needle/:volume_id/:photo_id", get(get_needle).delete(delete_needle))
        .route("/copy", post(copy).route_layer(write_limit))
        .route("/stats", get(stats))
        .with_state(ctx)
        .layer(axum::Extension(limiter))
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::Full => StatusCode::INSUFFICIENT_STORAGE,
            StoreError::Corrupt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::NoSuchVolume(_) => StatusCode::NOT_FOUND,
            StoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Deserialize)]
struct CookieQuery {
    cookie: Option<String>,
}

#[derive(Serialize)]
struct PutResponse {
    volume_id: VolumeId,
}

async fn put_needle(
    State(ctx): State<Arc<StoreContext>>,
    Path(photo_id): Path<PhotoId>,
    Query(q): Query<CookieQuery>,
    body: Bytes,
) -> Result<Json<PutResponse>, StoreError> {
    let cookie_str = q.cookie.ok_or_else(|| StoreError::BadRequest("missing cookie".into()))?;
    let cookie: CookieBuf = cookie_str
        .parse()
        .map_err(|_| StoreError::BadRequest("malformed cookie".into()))?;

    let machine = ctx.machine.clone();
    let body = body.to_vec();
    let cache_copy = body.clone();
    let volume_id = tokio::task::spawn_blocking(move || machine.put(photo_id, cookie.data(), &body))
        .await
        .map_err(|_| StoreError::Io(std::io::Error::other("blocking task panicked")))??;

    if let Some(cache) = &ctx.cache {
        cache.put(photo_id, Bytes::from(cache_copy), None).await;
    }

    Ok(Json(PutResponse { volume_id }))
}

async fn get_needle(
    State(ctx): State<Arc<StoreContext>>,
    Path((volume_id, photo_id)): Path<(VolumeId, PhotoId)>,
    Query(q): Query<CookieQuery>,
) -> Result<Bytes, StoreError> {
    let machine = ctx.machine.clone();
    let (needle_cookie, data) = tokio::task::spawn_blocking(move || machine.get(volume_id, photo_id))
        .await
        .map_err(|_| StoreError::Io(std::io::Error::other("blocking task panicked")))??
        .ok_or(StoreError::NotFound)?;

    if let Some(cookie_str) = q.cookie {
        let cookie: CookieBuf = cookie_str
            .parse()
            .map_err(|_| StoreError::BadRequest("malformed cookie".into()))?;
        if cookie.data() != &needle_cookie {
            return Err(StoreError::BadRequest("incorrect cookie".into()));
        }
    }

    Ok(Bytes::from(data))
}

async fn delete_needle(
    State(ctx): State<Arc<StoreContext>>,
    Extension(limiter): Extension<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Path((volume_id, photo_id)): Path<(VolumeId, PhotoId)>,
) -> Response {
    if !limiter.try_acquire(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    let machine = ctx.machine.clone();
    let result: Result<(), StoreError> = async {
        tokio::task::spawn_blocking(move || machine.delete(volume_id, photo_id))
            .await
            .map_err(|_| StoreError::Io(std::io::Error::other("blocking task panicked")))??;
        Ok(())
    }
    .await;

    if result.is_ok() {
        if let Some(cache) = &ctx.cache {
            cache.invalidate(photo_id).await;
        }
    }

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct CopyRequest {
    id: PhotoId,
    to: String,
}

/// `POST /copy` — streams a blob this store holds directly to another store's
/// address, reusing its original cookie. Used exclusively by the Replication Manager
/// to realize an up-replication decision.
async fn copy(
    State(ctx): State<Arc<StoreContext>>,
    Json(req): Json<CopyRequest>,
) -> Result<Json<PutResponse>, StoreError> {
    let volume_id = ctx.copy_to(req.id, &req.to).await?;
    Ok(Json(PutResponse { volume_id }))
}

#[derive(Serialize)]
struct VolumeStatsBody {
    volume_id: VolumeId,
    sealed: bool,
    num_needles: usize,
    volume_bytes: u64,
    live_bytes: u64,
}

#[derive(Serialize)]
struct StatsBody {
    machine_id: u32,
    free_bytes: u64,
    ops_window_60s: u64,
    volumes: Vec<VolumeStatsBody>,
}

impl From<StoreStats> for StatsBody {
    fn from(s: StoreStats) -> StatsBody {
        StatsBody {
            machine_id: s.machine_id,
            free_bytes: s.free_bytes,
            ops_window_60s: s.ops_window_60s,
            volumes: s
                .volumes
                .into_iter()
                .map(|v| VolumeStatsBody {
                    volume_id: v.volume_id,
                    sealed: v.sealed,
                    num_needles: v.num_needles,
                    volume_bytes: v.volume_bytes,
                    live_bytes: v.live_bytes,
                })
                .collect(),
        }
    }
}

async fn stats(State(ctx): State<Arc<StoreContext>>) -> Json<StatsBody> {
    Json(ctx.machine.stats().into())
}
