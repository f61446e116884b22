//! Background expiry of idle sessions

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::SessionStore;
use crate::config::SessionConfig;

/// Periodically persists and evicts sessions idle beyond the timeout
pub struct SessionReaper {
    store: Arc<SessionStore>,
    timeout: Duration,
    interval: Duration,
}

impl SessionReaper {
    #[must_use]
    pub const fn new(store: Arc<SessionStore>, timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            timeout,
            interval,
        }
    }

    /// Run one sweep against the current time
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let expired = self.store.expire_idle(now, self.timeout).await;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), sessions = ?expired, "expired idle sessions");
        }
        expired.len()
    }

    /// Sweep every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        interval.tick().await;

        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "session reaper started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("session reaper stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

/// Spawn the reaper as a background task
#[must_use]
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    config: &SessionConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let reaper = SessionReaper::new(store, config.timeout, config.reap_interval);
    tokio::spawn(reaper.run(shutdown))
}
