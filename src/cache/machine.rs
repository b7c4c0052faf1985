//! State for one `haycache` process: a size-bounded LRU behind a `tokio::sync::Mutex`
//! (reads and writes both touch recency order, so a plain mutex is simpler and just as
//! correct here as an `RwLock`), plus the default TTL applied when a caller doesn't
//! specify one.
//!
//! Grounded in the teacher's `cache/machine.rs` `CacheMachine`, trimmed of the
//! store-proxying responsibility the teacher's cache takes on (`handle_proxy_request`)
//! since this system's Store and Cache are reached independently by the client.

use crate::cache::memory::MemoryStore;
use crate::types::PhotoId;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct CacheMachine {
    memory: Mutex<MemoryStore>,
    default_ttl: Duration,
    capacity_bytes: u64,
}

pub struct CacheStats {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub num_entries: usize,
}

impl CacheMachine {
    pub fn new(capacity_bytes: u64, default_ttl: Duration) -> CacheMachine {
        CacheMachine {
            memory: Mutex::new(MemoryStore::new(capacity_bytes)),
            default_ttl,
            capacity_bytes,
        }
    }

    pub async fn get(&self, id: PhotoId) -> Option<Bytes> {
        self.memory.lock().await.get(id)
    }

    /// `ttl` of `None` falls back to the configured default, matching `put(photo_id,
    /// bytes, ttl)`'s "best-effort" contract — a missing TTL is not an error.
    pub async fn put(&self, id: PhotoId, data: Bytes, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.memory.lock().await.put(id, data, ttl);
    }

    pub async fn invalidate(&self, id: PhotoId) {
        self.memory.lock().await.remove(id);
    }

    pub async fn stats(&self) -> CacheStats {
        let memory = self.memory.lock().await;
        CacheStats {
            used_bytes: memory.used_bytes(),
            capacity_bytes: self.capacity_bytes,
            num_entries: memory.len(),
        }
    }
}
