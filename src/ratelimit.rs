//! Per-source-address rate limiting for write endpoints, applied as an axum
//! middleware layer to the Store's and Directory's write routes.
//!
//! A contract point rather than core design per the spec: a simple fixed-window token
//! bucket keyed by the caller's socket address, backed by `dashmap` the way the rest
//! of this crate reaches for `dashmap` over a mutex-guarded `HashMap` for anything
//! touched from multiple request-handling tasks at once.

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared limiter state: `capacity` tokens refilled at `refill_per_sec` tokens/second,
/// one bucket per source IP. Cheap to clone; wraps an `Arc`.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> RateLimiter {
        RateLimiter {
            buckets: Arc::new(DashMap::new()),
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
        }
    }

    /// Consumes one token for `addr`, returning `false` once its bucket is empty.
    pub(crate) fn try_acquire(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(addr).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Periodically drops buckets that have been fully idle, so a long-running process
    /// doesn't accumulate one entry per ever-seen client forever.
    pub fn sweep_idle(&self, idle_after: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, b| now.duration_since(b.last_refill) < idle_after);
    }
}

pub async fn enforce<B>(
    State(limiter): State<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    if limiter.try_acquire(addr.ip()) {
        next.run(request).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_refills_bucket() {
        let limiter = RateLimiter::new(2, 1);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(limiter.try_acquire(addr));
        assert!(limiter.try_acquire(addr));
        assert!(!limiter.try_acquire(addr), "third request within the same instant should be limited");
    }

    #[test]
    fn distinct_addresses_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();

        assert!(limiter.try_acquire(a));
        assert!(limiter.try_acquire(b));
    }
}
