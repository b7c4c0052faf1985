//! The Replication Manager's HTTP surface: purely observational, no write path of its
//! own — every mutation it makes goes through the Directory leader or a Store.

use crate::replication::ReplicationManager;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub fn router(manager: Arc<ReplicationManager>) -> Router {
    Router::new().route("/status", get(status)).with_state(manager)
}

#[derive(Serialize)]
struct StatusBody {
    tick: u64,
    duration_ms: u64,
    under_replicated: u64,
    over_replicated: u64,
    holds_lock: bool,
}

async fn status(State(manager): State<Arc<ReplicationManager>>) -> Json<StatusBody> {
    let s = manager.stats();
    Json(StatusBody {
        tick: s.tick,
        duration_ms: s.duration_ms,
        under_replicated: s.under_replicated,
        over_replicated: s.over_replicated,
        holds_lock: s.holds_lock,
    })
}
