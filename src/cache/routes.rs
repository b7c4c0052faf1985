//! The Cache's HTTP surface: `GET /get`, `POST /put`, `POST /invalidate`, `GET
//! /stats`.
//!
//! Grounded in the teacher's `cache/routes.rs` request dispatch, ported from the
//! teacher's hand-rolled path-segment matching (`CachePath::from`) to axum's typed
//! query extractors, and trimmed of the teacher's store-proxying mode since this
//! system's client reaches the Cache and Store independently (push-on-write populates
//! the cache instead of the cache pulling through to a Store on miss).

use crate::cache::machine::CacheMachine;
use crate::types::PhotoId;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub fn router(cache: Arc<CacheMachine>) -> Router {
    Router::new()
        .route("/get", get(get_entry))
        .route("/put", post(put_entry))
        .route("/invalidate", post(invalidate))
        .route("/stats", get(stats))
        .with_state(cache)
}

#[derive(Deserialize)]
struct IdQuery {
    id: PhotoId,
}

async fn get_entry(State(cache): State<Arc<CacheMachine>>, Query(q): Query<IdQuery>) -> Result<Bytes, StatusCode> {
    cache.get(q.id).await.ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct PutQuery {
    id: PhotoId,
    ttl: Option<u64>,
}

async fn put_entry(State(cache): State<Arc<CacheMachine>>, Query(q): Query<PutQuery>, body: Bytes) -> StatusCode {
    cache.put(q.id, body, q.ttl.map(Duration::from_secs)).await;
    StatusCode::OK
}

async fn invalidate(State(cache): State<Arc<CacheMachine>>, Query(q): Query<IdQuery>) -> StatusCode {
    cache.invalidate(q.id).await;
    StatusCode::OK
}

#[derive(Serialize)]
struct StatsBody {
    used_bytes: u64,
    capacity_bytes: u64,
    num_entries: usize,
}

async fn stats(State(cache): State<Arc<CacheMachine>>) -> Json<StatsBody> {
    let s = cache.stats().await;
    Json(StatsBody {
        used_bytes: s.used_bytes,
        capacity_bytes: s.capacity_bytes,
        num_entries: s.num_entries,
    })
}
