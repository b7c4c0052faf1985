//! Generalizes the teacher's `background_thread.rs` (an OS-thread + condvar design)
//! into an async task wrapped in a cancellation token, matching how the rest of this
//! crate schedules periodic work (heartbeats, compaction sweeps, GC, health scans,
//! lease refresh, follower sync, replication ticks) on the shared `tokio` runtime
//! instead of one OS thread per activity.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A periodic activity that can be stopped cleanly from outside.
pub struct BackgroundTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawns `body` to run every `period`, stopping as soon as possible once
    /// `stop()` is called (it will not be interrupted mid-iteration).
    pub fn spawn<F, Fut>(period: Duration, mut body: F) -> BackgroundTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        body().await;
                    }
                }
            }
        });

        BackgroundTask {
            token,
            handle: Some(handle),
        }
    }

    /// Requests cancellation and waits for the current iteration to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
