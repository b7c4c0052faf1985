//! The end-user client library backing the `hay` CLI: `upload`, `download`, `status`,
//! `stats`. Grounded in the teacher's `client/mod.rs` `Client::upload_photo` (allocate
//! via the Directory, write to every chosen store, then commit), generalized from a
//! single `Directory::open()` handle tied to one process into a pure HTTP client that
//! can run from any machine, and extended with the download and inspection paths the
//! teacher's stub left as TODOs.

pub mod cache_client;
pub mod directory_client;
pub mod store_client;

use crate::client::cache_client::CacheClient;
use crate::client::directory_client::DirectoryClient;
use crate::client::store_client::StoreClient;
use crate::error::{DirectoryError, DirectoryResult};
use crate::paths::CookieBuf;
use crate::types::{MachineId, PhotoId};
use sha2::{Digest, Sha256};

pub struct Client {
    directory: DirectoryClient,
    cache: Option<CacheClient>,
}

pub struct UploadSummary {
    pub id: PhotoId,
    pub replicas_written: usize,
}

pub struct StatusSummary {
    pub id: PhotoId,
    pub size: u64,
    pub checksum: Vec<u8>,
    pub healthy_replicas: usize,
}

impl Client {
    pub fn new(directory_addrs: Vec<String>, cache_addr: Option<String>) -> Client {
        Client {
            directory: DirectoryClient::new(directory_addrs),
            cache: cache_addr.map(CacheClient::new),
        }
    }

    /// Uploads `data` as a new photo: allocates an id and placement from the Directory
    /// leader, writes the bytes to every chosen store under one freshly generated
    /// cookie, then commits the actually-written location set. Best-effort primes the
    /// cache so an immediate re-download hits.
    pub async fn upload(&self, data: Vec<u8>) -> DirectoryResult<UploadSummary> {
        let size = data.len() as u64;
        let checksum = Sha256::digest(&data);

        let (id, candidates) = self.directory.register(size).await?;
        if candidates.is_empty() {
            return Err(DirectoryError::NoHealthyStores);
        }

        let cookie = CookieBuf::generate();
        let mut written: Vec<(MachineId, u32)> = Vec::new();
        for candidate in &candidates {
            let store = StoreClient::new(candidate.addr.clone());
            match store.put(id, &cookie, data.clone()).await {
                Ok(volume_id) => written.push((candidate.machine_id, volume_id)),
                Err(e) => tracing::warn!(machine_id = candidate.machine_id, error = %e, "upload: store write failed"),
            }
        }

        if written.is_empty() {
            return Err(DirectoryError::NoHealthyStores);
        }

        self.directory.commit(id, cookie.data(), size, &checksum, written.clone()).await?;

        if let Some(cache) = &self.cache {
            cache.put(id, bytes::Bytes::from(data), None).await;
        }

        Ok(UploadSummary {
            id,
            replicas_written: written.len(),
        })
    }

    /// Downloads a photo's bytes: the cache first, then any healthy replica reported
    /// by `locate`, stopping at the first one that answers. On success, re-primes the
    /// cache so repeated downloads of a cold blob converge to a cache hit.
    pub async fn download(&self, id: PhotoId) -> DirectoryResult<Vec<u8>> {
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.get(id).await {
                return Ok(data.to_vec());
            }
        }

        let info = self.directory.locate(id).await?;
        let cookie = CookieBuf::from_bytes(info.cookie);

        for replica in &info.replicas {
            let store = StoreClient::new(replica.addr.clone());
            match store.get(replica.volume_id, id, &cookie).await {
                Ok(data) => {
                    if let Some(cache) = &self.cache {
                        cache.put(id, bytes::Bytes::from(data.clone()), None).await;
                    }
                    return Ok(data);
                }
                Err(e) => tracing::warn!(machine_id = replica.machine_id, error = %e, "download: replica read failed"),
            }
        }

        Err(DirectoryError::NotFound)
    }

    /// `status <id>`: locates a photo without fetching its bytes, reporting its
    /// declared size/checksum and how many healthy replicas currently hold it.
    pub async fn status(&self, id: PhotoId) -> DirectoryResult<StatusSummary> {
        let info = self.directory.locate(id).await?;
        Ok(StatusSummary {
            id,
            size: info.size,
            checksum: info.checksum,
            healthy_replicas: info.replicas.len(),
        })
    }

    /// `stats`: the raw store descriptors known to the Directory, for an operator to
    /// eyeball cluster capacity and load.
    pub async fn stats(&self) -> DirectoryResult<Vec<crate::client::directory_client::StoreDescriptorBody>> {
        self.directory.stores().await
    }
}
