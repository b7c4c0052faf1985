//! Thin HTTP client for a Cache node. Used by the Store (push-on-write, invalidate on
//! delete), the Replication Manager (invalidate on de-replication eviction), and the
//! end-user [`crate::client::Client`] (read path, cache-first).
//!
//! Every method is best-effort: a cache miss or an unreachable cache is never an error
//! to the caller, matching the contract that "cache failures are never fatal to reads
//! or writes."

use crate::types::PhotoId;
use std::time::Duration;

#[derive(Clone)]
pub struct CacheClient {
    http: reqwest::Client,
    addr: String,
}

impl CacheClient {
    pub fn new(addr: String) -> CacheClient {
        CacheClient {
            http: reqwest::Client::new(),
            addr,
        }
    }

    pub async fn get(&self, id: PhotoId) -> Option<bytes::Bytes> {
        let resp = self
            .http
            .get(format!("http://{}/get?id={}", self.addr, id))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.bytes().await.ok()
    }

    pub async fn put(&self, id: PhotoId, data: bytes::Bytes, ttl: Option<Duration>) {
        let mut url = format!("http://{}/put?id={}", self.addr, id);
        if let Some(ttl) = ttl {
            url.push_str(&format!("&ttl={}", ttl.as_secs()));
        }
        let _ = self.http.post(url).body(data).send().await;
    }

    pub async fn invalidate(&self, id: PhotoId) {
        let _ = self
            .http
            .post(format!("http://{}/invalidate?id={}", self.addr, id))
            .send()
            .await;
    }
}
