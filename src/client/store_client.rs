//! Thin HTTP client for a Store node's needle endpoints, shared by the end-user
//! [`crate::client::Client`] (direct upload/download) and the Replication Manager
//! (issuing `copy_to` and de-replication deletes against a chosen Store address).

use crate::error::{StoreError, StoreResult};
use crate::paths::CookieBuf;
use crate::types::{PhotoId, VolumeId};
use serde::Deserialize;

#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    addr: String,
}

#[derive(Deserialize)]
struct PutResponse {
    volume_id: VolumeId,
}

impl StoreClient {
    pub fn new(addr: String) -> StoreClient {
        StoreClient {
            http: reqwest::Client::new(),
            addr,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// `POST /needle/:photo_id?cookie=` — writes a new needle, letting the store pick
    /// its active volume. Returns the volume id it landed in.
    pub async fn put(&self, photo_id: PhotoId, cookie: &CookieBuf, body: Vec<u8>) -> StoreResult<VolumeId> {
        let url = format!("http://{}/needle/{}?cookie={}", self.addr, photo_id, cookie);
        let resp = self
            .http
            .put(url)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::BadRequest(e.to_string()))?;
        check_status(&resp)?;
        let body: PutResponse = resp.json().await.map_err(|e| StoreError::BadRequest(e.to_string()))?;
        Ok(body.volume_id)
    }

    /// `GET /needle/:volume_id/:photo_id?cookie=` — reads a needle's bytes back.
    pub async fn get(&self, volume_id: VolumeId, photo_id: PhotoId, cookie: &CookieBuf) -> StoreResult<Vec<u8>> {
        let url = format!(
            "http://{}/needle/{}/{}?cookie={}",
            self.addr, volume_id, photo_id, cookie
        );
        let resp = self.http.get(url).send().await.map_err(|e| StoreError::BadRequest(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        check_status(&resp)?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StoreError::BadRequest(e.to_string()))
    }

    pub async fn delete(&self, volume_id: VolumeId, photo_id: PhotoId) -> StoreResult<()> {
        let url = format!("http://{}/needle/{}/{}", self.addr, volume_id, photo_id);
        let resp = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|e| StoreError::BadRequest(e.to_string()))?;
        check_status(&resp)
    }

    /// `POST /copy` — asks this store to stream a blob it holds directly to `to_addr`.
    /// Returns the volume id the blob landed in on the destination.
    pub async fn copy_to(&self, photo_id: PhotoId, to_addr: &str) -> StoreResult<VolumeId> {
        let url = format!("http://{}/copy", self.addr);
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "id": photo_id, "to": to_addr }))
            .send()
            .await
            .map_err(|e| StoreError::BadRequest(e.to_string()))?;
        check_status(&resp)?;
        let body: PutResponse = resp.json().await.map_err(|e| StoreError::BadRequest(e.to_string()))?;
        Ok(body.volume_id)
    }
}

fn check_status(resp: &reqwest::Response) -> StoreResult<()> {
    if resp.status().is_success() {
        Ok(())
    } else if resp.status() == reqwest::StatusCode::INSUFFICIENT_STORAGE {
        Err(StoreError::Full)
    } else {
        Err(StoreError::BadRequest(resp.status().to_string()))
    }
}
