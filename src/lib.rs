//! A distributed append-only blob (photo) store modeled on the Haystack
//! architecture: Store volumes on disk, a Postgres/Redis-backed Directory
//! for metadata and leader election, a Replication Manager control loop,
//! and an LRU Cache in front of reads.

pub mod background;
pub mod cache;
pub mod client;
pub mod config;
pub mod coordination;
pub mod directory;
pub mod error;
pub mod paths;
pub mod ratelimit;
pub mod replication;
pub mod store;
pub mod types;

pub use config::HaystackConfig;
pub use error::{HaystackError, HaystackResult};
