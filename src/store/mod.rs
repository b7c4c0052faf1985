//! A Store process: the on-disk volume machinery in [`machine`], plus the HTTP client
//! context needed for `copy_to` (streaming a blob directly to a peer Store, as used by
//! the Replication Manager) and for reporting to the Directory.

pub mod compaction;
pub mod gc;
pub mod heartbeat;
pub mod machine;
pub mod needle;
pub mod routes;
pub mod volume;

use crate::client::cache_client::CacheClient;
use crate::client::directory_client::DirectoryClient;
use crate::error::{StoreError, StoreResult};
use crate::paths::CookieBuf;
use crate::store::machine::StoreMachine;
use crate::types::PhotoId;
use std::sync::Arc;

/// Everything a running Store process needs beyond the on-disk machine itself: its
/// own advertised address (embedded in needle copy requests and heartbeats), an HTTP
/// client for talking to peer Stores and the Directory, the Directory client used by
/// the heartbeat and GC background tasks, and an optional Cache client so writes push
/// bytes forward and deletes invalidate without the caller waiting on a round trip.
pub struct StoreContext {
    pub machine: Arc<StoreMachine>,
    pub self_addr: String,
    pub directory: DirectoryClient,
    pub cache: Option<CacheClient>,
    http: reqwest::Client,
}

impl StoreContext {
    pub fn new(
        machine: Arc<StoreMachine>,
        self_addr: String,
        directory: DirectoryClient,
        cache: Option<CacheClient>,
    ) -> StoreContext {
        StoreContext {
            machine,
            self_addr,
            directory,
            cache,
            http: reqwest::Client::new(),
        }
    }

    /// Streams a blob this store holds directly to `peer_addr`, reusing the needle's
    /// original cookie so the copy is indistinguishable from the first write. Returns
    /// the volume id the photo landed in on the peer, which the caller (the
    /// Replication Manager) must record against the peer's machine id via
    /// `Directory::add_location`.
    pub async fn copy_to(&self, photo_id: PhotoId, peer_addr: &str) -> StoreResult<u32> {
        let volume_id = self
            .machine
            .find_volume_for(photo_id)
            .ok_or(StoreError::NotFound)?;

        let (cookie, data) = self
            .machine
            .get(volume_id, photo_id)?
            .ok_or(StoreError::NotFound)?;

        let cookie_buf = CookieBuf::from_bytes(cookie);
        let url = format!("http://{}/needle/{}?cookie={}", peer_addr, photo_id, cookie_buf);

        #[derive(serde::Deserialize)]
        struct PutResponse {
            volume_id: u32,
        }

        let resp = self
            .http
            .put(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| StoreError::BadRequest(format!("copy_to peer unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(StoreError::BadRequest(format!(
                "copy_to peer rejected write with status {}",
                resp.status()
            )));
        }

        let body: PutResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::BadRequest(format!("copy_to peer sent malformed response: {}", e)))?;
        Ok(body.volume_id)
    }
}
