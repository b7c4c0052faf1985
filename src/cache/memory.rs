//! The in-memory store backing a Cache node: an `lru::LruCache` bounded by total byte
//! size rather than entry count, since photo sizes vary by orders of magnitude.
//!
//! Grounded in the teacher's `cache/memory.rs` `MemoryStore` (size-tracked eviction,
//! TTL-based staleness), ported from a hand-rolled `HashMap` + `BTreeMap` ordering
//! index onto `lru::LruCache`, which already maintains recency order for us.

use crate::types::PhotoId;
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct Entry {
    data: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

/// A size-bounded LRU keyed by photo id. Capacity is tracked in bytes; `lru::LruCache`
/// itself is constructed with an effectively unbounded entry count and we evict by
/// popping its least-recently-used entry until we are back under budget.
pub struct MemoryStore {
    capacity_bytes: u64,
    used_bytes: u64,
    entries: LruCache<PhotoId, Entry>,
}

impl MemoryStore {
    pub fn new(capacity_bytes: u64) -> MemoryStore {
        MemoryStore {
            capacity_bytes,
            used_bytes: 0,
            entries: LruCache::unbounded(),
        }
    }

    /// Looks up `id`, returning `None` on a miss or once its TTL has elapsed (expired
    /// entries are evicted immediately rather than left to the next `collect`).
    pub fn get(&mut self, id: PhotoId) -> Option<Bytes> {
        let expired = match self.entries.peek(&id) {
            Some(e) => e.inserted_at.elapsed() >= e.ttl,
            None => return None,
        };

        if expired {
            self.remove(id);
            return None;
        }

        self.entries.get(&id).map(|e| e.data.clone())
    }

    /// Inserts or replaces `id`'s cached bytes, then evicts least-recently-used entries
    /// until total usage is back within `capacity_bytes`. An entry larger than the
    /// entire capacity is simply not cached.
    pub fn put(&mut self, id: PhotoId, data: Bytes, ttl: Duration) {
        if data.len() as u64 > self.capacity_bytes {
            return;
        }

        self.remove(id);

        self.used_bytes += data.len() as u64;
        self.entries.put(
            id,
            Entry {
                data,
                inserted_at: Instant::now(),
                ttl,
            },
        );

        while self.used_bytes > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.used_bytes -= evicted.data.len() as u64,
                None => break,
            }
        }
    }

    pub fn remove(&mut self, id: PhotoId) {
        if let Some(e) = self.entries.pop(&id) {
            self.used_bytes -= e.data.len() as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_hit() {
        let mut store = MemoryStore::new(1024);
        store.put(1, Bytes::from_static(b"hello"), Duration::from_secs(60));
        assert_eq!(store.get(1), Some(Bytes::from_static(b"hello")));
        assert_eq!(store.used_bytes(), 5);
    }

    #[test]
    fn miss_returns_none() {
        let mut store = MemoryStore::new(1024);
        assert_eq!(store.get(99), None);
    }

    #[test]
    fn expired_entry_is_treated_as_a_miss() {
        let mut store = MemoryStore::new(1024);
        store.put(1, Bytes::from_static(b"hello"), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get(1), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn eviction_keeps_usage_within_capacity() {
        let mut store = MemoryStore::new(10);
        store.put(1, Bytes::from(vec![0u8; 6]), Duration::from_secs(60));
        store.put(2, Bytes::from(vec![0u8; 6]), Duration::from_secs(60));
        assert!(store.used_bytes() <= 10);
        assert!(store.get(1).is_none(), "oldest entry should have been evicted");
        assert!(store.get(2).is_some());
    }

    #[test]
    fn entry_larger_than_capacity_is_not_cached() {
        let mut store = MemoryStore::new(4);
        store.put(1, Bytes::from(vec![0u8; 10]), Duration::from_secs(60));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut store = MemoryStore::new(1024);
        store.put(1, Bytes::from_static(b"hello"), Duration::from_secs(60));
        store.remove(1);
        assert_eq!(store.get(1), None);
        assert_eq!(store.used_bytes(), 0);
    }
}
