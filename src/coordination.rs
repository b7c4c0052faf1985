//! Thin wrapper around the shared coordination store (Redis), providing the two
//! primitives the rest of the system is built on: a create-if-absent, TTL'd lease
//! (used for Directory leader election) and a simple advisory lock (used to ensure
//! only one Replication Manager instance runs its control loop at a time).
//!
//! Redis itself is an external collaborator (out of scope per the spec); this module
//! is the contract point.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// A handle to the coordination store. Cheap to clone: wraps a multiplexed
/// connection that redis-rs reconnects transparently.
#[derive(Clone)]
pub struct Coordinator {
    conn: ConnectionManager,
}

/// Lua script for refreshing a lease: only extends the TTL if the value still
/// matches the caller's candidate id, preventing a demoted-then-revived leader from
/// clobbering whoever holds the lease now.
const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lua script for releasing a lease: only deletes it if the value still matches.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl Coordinator {
    pub async fn connect(redis_url: &str) -> CoordinationResult<Coordinator> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Coordinator { conn })
    }

    /// Attempts to acquire `key` with `value`, succeeding only if the key is absent.
    /// Returns `true` on success.
    pub async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Extends `key`'s TTL, but only if `value` still owns it. Returns `true` if the
    /// refresh succeeded (the caller still holds the lease).
    pub async fn refresh(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = redis::Script::new(REFRESH_SCRIPT)
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    /// Releases `key`, but only if `value` still owns it.
    pub async fn release(&self, key: &str, value: &str) -> CoordinationResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Reads the current holder of `key`, if any (used by followers to learn the
    /// current leader's address).
    pub async fn read(&self, key: &str) -> CoordinationResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// Writes a cache payload with a TTL. Used for the `cache/<photo_id>` key space.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> CoordinationResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> CoordinationResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> CoordinationResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
