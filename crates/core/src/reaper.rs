//! Periodic eviction of idle sessions.

use crate::registry::SessionRegistry;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tracing::{debug, info, instrument};

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REAP_INTERVAL,
            ttl: DEFAULT_SESSION_TTL,
        }
    }
}

/// Force-closes sessions whose last activity is older than the TTL, and
/// sessions whose upstream has died while no turn is running.
pub struct SessionReaper {
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
}

impl SessionReaper {
    pub fn new(registry: Arc<SessionRegistry>, config: ReaperConfig) -> Self {
        Self { registry, config }
    }

    /// Runs one sweep and returns how many sessions were evicted.
    ///
    /// Closing a session mid-turn enqueues a completion marker, so an in-flight
    /// `process_turn` finishes on its own with whatever it had collected.
    #[instrument(name = "reaper_sweep", skip_all)]
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for session in self.registry.snapshot().await {
            let idle_for = session.idle_for(now).await;
            let expired = idle_for > self.config.ttl;
            let dead = !session.is_turn_in_progress() && !session.upstream_alive().await;
            if !expired && !dead {
                continue;
            }
            // Another closer may have won the race; removal and shutdown are both idempotent.
            self.registry.remove(session.id()).await;
            session.shutdown().await;
            reaped += 1;
            info!(
                session_id = %session.id(),
                idle_secs = idle_for.as_secs(),
                expired,
                upstream_dead = dead,
                "Reaped session"
            );
        }
        reaped
    }

    /// Spawns the sweep loop. Abort the returned handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = self.sweep().await;
                debug!(reaped, "Reaper sweep finished");
            }
        })
    }
}
