//! Background tasks: heartbeat emitter and stale-node sweeper.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use steep_db::Db;
use steep_types::NodeId;

use crate::RegistryStore;

/// Liveness thresholds derived from the heartbeat interval.
#[derive(Debug, Clone, Copy)]
pub struct LivenessThresholds {
    pub stale_after: Duration,
    pub unreachable_after: Duration,
}

impl LivenessThresholds {
    /// Recommended defaults: stale at 3x the interval, unreachable at 10x.
    pub fn from_interval(interval: Duration, stale_multiplier: u32, unreachable_multiplier: u32) -> Self {
        Self {
            stale_after: interval * stale_multiplier,
            unreachable_after: interval * unreachable_multiplier,
        }
    }
}

/// Periodically refreshes this node's own registry row.
///
/// A heartbeat failure is logged and the loop continues; it never
/// terminates the daemon.
pub struct HeartbeatTask {
    pub db: Db,
    pub node_id: NodeId,
    pub interval: Duration,
}

impl HeartbeatTask {
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.beat().await {
                Ok(()) => debug!(node = %self.node_id, "heartbeat"),
                Err(e) => warn!(node = %self.node_id, error = %e, "heartbeat failed; continuing"),
            }
        }
        debug!("heartbeat task stopped");
    }

    async fn beat(&self) -> Result<(), crate::RegistryError> {
        let client = self.db.get().await?;
        RegistryStore::heartbeat(&**client, &self.node_id).await?;
        Ok(())
    }
}

/// Periodically derives liveness from heartbeat recency, re-runs the
/// coordinator election, and sweeps expired init slots.
pub struct SweeperTask {
    pub db: Db,
    pub node_id: NodeId,
    pub interval: Duration,
    pub thresholds: LivenessThresholds,
}

impl SweeperTask {
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "liveness sweep failed; continuing");
            }
        }
        debug!("sweeper task stopped");
    }

    async fn sweep(&self) -> Result<(), crate::RegistryError> {
        let client = self.db.get().await?;
        let changed = RegistryStore::sweep_liveness(
            &**client,
            self.thresholds.stale_after.as_secs() as i64,
            self.thresholds.unreachable_after.as_secs() as i64,
        )
        .await?;
        if changed > 0 {
            debug!(changed, "liveness transitions applied");
        }

        // The computed winner claims coordinatorship only for itself.
        if let Some(winner) = RegistryStore::election_winner(&**client).await? {
            if winner == self.node_id {
                RegistryStore::claim_coordinator(&**client, &self.node_id).await?;
            }
        }

        // Expired, unconsumed init slots age out of the registry. The slot
        // itself is dropped by the init machinery that owns it.
        client
            .execute(
                "DELETE FROM steep_repl.init_slots
                 WHERE expires_at IS NOT NULL AND expires_at < now() AND used_at IS NULL",
                &[],
            )
            .await
            .map_err(steep_db::DbError::from)?;

        // Snapshots past retention are marked expired and their
        // directories removed.
        let expired = client
            .query(
                "UPDATE steep_repl.snapshots
                 SET status = 'expired'
                 WHERE expires_at IS NOT NULL AND expires_at < now()
                   AND status IN ('complete', 'applied')
                 RETURNING storage_path",
                &[],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        for row in expired {
            let Some(path) = row.get::<_, Option<String>>(0) else {
                continue;
            };
            if let Err(e) = std::fs::remove_dir_all(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%path, error = %e, "failed to remove expired snapshot");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_recommended_multipliers() {
        let t = LivenessThresholds::from_interval(Duration::from_secs(10), 3, 10);
        assert_eq!(t.stale_after, Duration::from_secs(30));
        assert_eq!(t.unreachable_after, Duration::from_secs(100));
    }
}
