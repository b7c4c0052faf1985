//! Leader election among Directory replicas, built on the Redis lease primitive in
//! [`crate::coordination`]. Exactly one Directory process accepts writes
//! (`register`/`commit`/`mark_deleted`) at a time; the rest serve reads from their own
//! replicated copy of the metadata and redirect writes to the leader.

use crate::coordination::Coordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LEADER_KEY: &str = "directory/leader";

pub struct LeaderElection {
    coordinator: Coordinator,
    self_addr: String,
    ttl: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElection {
    pub fn new(coordinator: Coordinator, self_addr: String, ttl: Duration) -> LeaderElection {
        LeaderElection {
            coordinator,
            self_addr,
            ttl,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    /// Returns the current leader's advertised address, if any is held.
    pub async fn current_leader(&self) -> Option<String> {
        self.coordinator.read(LEADER_KEY).await.ok().flatten()
    }

    /// One election tick: try to become leader if nobody holds the lease, otherwise
    /// refresh it if we already do. Called periodically from a
    /// [`crate::background::BackgroundTask`].
    pub async fn tick(&self) {
        if self.is_leader() {
            match self.coordinator.refresh(LEADER_KEY, &self.self_addr, self.ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("lost directory leadership: lease was claimed by another node");
                    self.is_leader.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(error = %e, "failed to refresh leader lease, assuming leadership is lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                }
            }
            return;
        }

        match self
            .coordinator
            .try_acquire(LEADER_KEY, &self.self_addr, self.ttl)
            .await
        {
            Ok(true) => {
                info!(addr = %self.self_addr, "became directory leader");
                self.is_leader.store(true, Ordering::SeqCst);
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "leader election tick failed"),
        }
    }

    /// Releases the lease on a clean shutdown so the next election doesn't have to
    /// wait out the full TTL.
    pub async fn resign(&self) {
        if self.is_leader() {
            let _ = self.coordinator.release(LEADER_KEY, &self.self_addr).await;
            self.is_leader.store(false, Ordering::SeqCst);
        }
    }
}
