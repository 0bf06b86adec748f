//! Progress fabric: the bounded in-process bus that carries
//! [`ProgressUpdate`] records from pipeline stages to RPC streams, the
//! polling store, and the database NOTIFY channel.
//!
//! Writers never block. Each subscriber owns its own queue; a subscriber
//! that falls behind drops the oldest updates and observes a gap rather
//! than applying backpressure to the pipeline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use steep_db::{Db, Notifier, PROGRESS_CHANNEL};
use steep_types::{NodeId, ProgressUpdate};

/// Bus capacity per daemon. Each subscriber can lag this many updates
/// before observing a gap.
pub const BUS_CAPACITY: usize = 256;

/// Per-daemon progress fabric: bus plus latest-value store.
///
/// Created once at daemon start and torn down at stop; tests instantiate
/// their own without touching any global.
#[derive(Clone)]
pub struct ProgressFabric {
    sender: broadcast::Sender<ProgressUpdate>,
    latest: Arc<RwLock<HashMap<String, ProgressUpdate>>>,
}

impl Default for ProgressFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressFabric {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender,
            latest: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publishes one update: refreshes the latest-value store and fans out
    /// to every live subscriber. Never blocks; returns the number of
    /// subscribers that will see the update.
    pub fn publish(&self, update: ProgressUpdate) -> usize {
        {
            let mut latest = self.latest.write().expect("latest store lock poisoned");
            latest.insert(update.operation_id.clone(), update.clone());
        }
        // A send error only means no subscriber is currently attached.
        self.sender.send(update).unwrap_or(0)
    }

    /// Attaches a new subscriber receiving every subsequent update.
    pub fn subscribe(&self) -> ProgressSubscriber {
        ProgressSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Latest update for one operation, if it has not been reaped.
    pub fn latest(&self, operation_id: &str) -> Option<ProgressUpdate> {
        self.latest
            .read()
            .expect("latest store lock poisoned")
            .get(operation_id)
            .cloned()
    }

    /// Latest update for the most recently updated operation on a node.
    pub fn latest_for_node(&self, node_id: &NodeId) -> Option<ProgressUpdate> {
        self.latest
            .read()
            .expect("latest store lock poisoned")
            .values()
            .filter(|u| &u.node_id == node_id)
            .max_by(|a, b| {
                a.overall_percent
                    .partial_cmp(&b.overall_percent)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Removes a terminal operation from the polling store.
    pub fn reap(&self, operation_id: &str) {
        self.latest
            .write()
            .expect("latest store lock poisoned")
            .remove(operation_id);
    }
}

/// One subscriber's view of the bus.
pub struct ProgressSubscriber {
    receiver: broadcast::Receiver<ProgressUpdate>,
}

impl ProgressSubscriber {
    /// Waits for the next update. Updates skipped because this subscriber
    /// lagged are counted and logged, never redelivered.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "progress subscriber lagged; continuing");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// JSON payload mirrored onto the `steep_repl_progress` NOTIFY channel.
///
/// Shape matches the in-database observers' contract:
/// `{op, id, phase, percent, tables_completed, tables_total, table?, bytes, eta?, error?}`.
pub fn notify_payload(update: &ProgressUpdate) -> String {
    let mut payload = serde_json::json!({
        "op": update.operation.as_str(),
        "id": update.operation_id,
        "phase": update.phase.as_str(),
        "percent": (f64::from(update.overall_percent) * 10.0).round() / 10.0,
        "tables_completed": update.tables_completed,
        "tables_total": update.tables_total,
        "bytes": update.bytes_copied,
    });
    let map = payload.as_object_mut().expect("payload is an object");
    if let Some(table) = &update.current_table {
        map.insert("table".to_string(), serde_json::json!(table));
    }
    if let Some(eta) = update.eta_seconds {
        map.insert("eta".to_string(), serde_json::json!(eta));
    }
    if let Some(error) = &update.error_message {
        map.insert("error".to_string(), serde_json::json!(error));
    }
    payload.to_string()
}

/// Forwards every bus update onto the database NOTIFY channel until the
/// fabric is dropped. Spawned once per daemon.
pub async fn run_notify_forwarder(fabric: ProgressFabric, db: Db) {
    let mut subscriber = fabric.subscribe();
    while let Some(update) = subscriber.recv().await {
        let payload = notify_payload(&update);
        match db.get().await {
            Ok(client) => {
                if let Err(e) = Notifier::notify(&**client, PROGRESS_CHANNEL, &payload).await {
                    warn!(error = %e, "failed to publish progress notification");
                }
            }
            Err(e) => warn!(error = %e, "progress forwarder could not borrow a connection"),
        }
    }
    debug!("progress notify forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use steep_types::{OperationKind, ProgressPhase};

    fn update(id: &str, percent: f32) -> ProgressUpdate {
        let mut u = ProgressUpdate::starting(
            OperationKind::Init,
            id.to_string(),
            NodeId::new("node-b"),
        );
        u.phase = ProgressPhase::Copying;
        u.overall_percent = percent;
        u
    }

    #[tokio::test]
    async fn fan_out_preserves_per_subscriber_order() {
        let fabric = ProgressFabric::new();
        let mut first = fabric.subscribe();
        let mut second = fabric.subscribe();

        for percent in [10.0, 20.0, 30.0] {
            fabric.publish(update("op-1", percent));
        }

        for subscriber in [&mut first, &mut second] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(subscriber.recv().await.unwrap().overall_percent);
            }
            assert_eq!(seen, vec![10.0, 20.0, 30.0]);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_observes_gap_not_backpressure() {
        let fabric = ProgressFabric::new();
        let mut slow = fabric.subscribe();

        // Overflow the bus capacity; publishing never blocks.
        for i in 0..(BUS_CAPACITY + 50) {
            fabric.publish(update("op-1", i as f32 / 10.0));
        }

        // The subscriber skips the dropped prefix and resumes in order.
        let first_seen = slow.recv().await.unwrap();
        assert!(first_seen.overall_percent > 0.0);
        let next = slow.recv().await.unwrap();
        assert!(next.overall_percent > first_seen.overall_percent);
    }

    #[tokio::test]
    async fn latest_store_tracks_and_reaps() {
        let fabric = ProgressFabric::new();
        assert!(fabric.latest("op-1").is_none());

        fabric.publish(update("op-1", 25.0));
        fabric.publish(update("op-1", 75.0));
        assert_eq!(fabric.latest("op-1").unwrap().overall_percent, 75.0);

        assert_eq!(
            fabric
                .latest_for_node(&NodeId::new("node-b"))
                .unwrap()
                .operation_id,
            "op-1"
        );

        fabric.reap("op-1");
        assert!(fabric.latest("op-1").is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let fabric = ProgressFabric::new();
        assert_eq!(fabric.publish(update("op-1", 5.0)), 0);
    }

    #[test]
    fn notify_payload_shape() {
        let mut u = update("op-1", 33.37);
        u.current_table = Some("public.users".to_string());
        u.eta_seconds = Some(12);
        let parsed: serde_json::Value = serde_json::from_str(&notify_payload(&u)).unwrap();
        assert_eq!(parsed["op"], "init");
        assert_eq!(parsed["id"], "op-1");
        assert_eq!(parsed["phase"], "copying");
        assert_eq!(parsed["percent"], 33.4);
        assert_eq!(parsed["table"], "public.users");
        assert_eq!(parsed["eta"], 12);
        assert!(parsed.get("error").is_none());
    }

    #[test]
    fn notify_payload_carries_error() {
        let u = update("op-2", 80.0).failed("copy aborted");
        let parsed: serde_json::Value = serde_json::from_str(&notify_payload(&u)).unwrap();
        assert_eq!(parsed["phase"], "failed");
        assert_eq!(parsed["error"], "copy aborted");
    }
}
