//! Crate-wide error types.
//!
//! Each component defines its own `thiserror` enum so that callers can match on the
//! specific failure kinds listed in the error handling design; `HaystackError` is the
//! umbrella type used to cross component boundaries (e.g. when the Replication Manager
//! calls into a Store's or Directory's library functions directly in tests).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store volume is full")]
    Full,

    #[error("needle not found")]
    NotFound,

    #[error("needle data is corrupt: {0}")]
    Corrupt(String),

    #[error("volume {0} not found on this store")]
    NoSuchVolume(VolumeId),

    #[error("malformed request: {0}")]
    BadRequest(String),
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("photo not found")]
    NotFound,

    #[error("this node is not the leader; current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("no healthy stores available to satisfy placement")]
    NoHealthyStores,

    #[error("coordination store error: {0}")]
    Coordination(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("entry not found")]
    Miss,

    #[error("payload too large for cache: {0} bytes")]
    TooLarge(usize),
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("store rpc error: {0}")]
    StoreRpc(String),

    #[error("could not acquire replication lock")]
    LockNotHeld,
}

#[derive(Error, Debug)]
pub enum HaystackError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

use crate::types::VolumeId;

pub type StoreResult<T> = Result<T, StoreError>;
pub type DirectoryResult<T> = Result<T, DirectoryError>;
pub type CacheResult<T> = Result<T, CacheError>;
pub type ReplicationResult<T> = Result<T, ReplicationError>;
pub type HaystackResult<T> = Result<T, HaystackError>;
